#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use site_backup_lib::archive::ArchiveEngine;
use site_backup_lib::backends::DatabaseDumper;
use site_backup_lib::orchestrator::{BackupMode, BackupResult, LocalBackup, Summary, UnitStatus};
use site_backup_lib::sites::{self, LocalConfig};
use site_backup_lib::util::artifact::{ArtifactKind, BackupLayout};
use site_backup_lib::util::retention::RetentionPolicy;
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    vhosts: PathBuf,
    dump_program: PathBuf,
    backup_root: PathBuf,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let document_root = dir.path().join("srv/app");
    fs::create_dir_all(document_root.join("public/css")).unwrap();
    fs::create_dir_all(document_root.join("node_modules/left-pad")).unwrap();
    fs::write(document_root.join("public/index.php"), "<?php echo 'hello';\n").unwrap();
    fs::write(document_root.join("public/css/app.css"), "body { margin: 0 }\n").unwrap();
    fs::write(document_root.join("node_modules/left-pad/index.js"), "module.exports = 1;\n").unwrap();
    fs::write(
        document_root.join(".env"),
        "APP_NAME=App\nDB_HOST=127.0.0.1\nDB_DATABASE=app\nDB_USERNAME=app_user\nDB_PASSWORD=\"s3cret\"\n",
    )
    .unwrap();

    let vhosts = dir.path().join("httpd.conf");
    fs::write(
        &vhosts,
        format!(
            "<VirtualHost *:80>\n    ServerName app.example.com\n    DocumentRoot {}\n</VirtualHost>\n",
            document_root.display()
        ),
    )
    .unwrap();

    let dump_program = dir.path().join("fake-mysqldump");
    fs::write(&dump_program, "#!/bin/sh\necho \"-- dump of $7 as $4\"\n").unwrap();
    fs::set_permissions(&dump_program, fs::Permissions::from_mode(0o755)).unwrap();

    let backup_root = dir.path().join("backups");
    Fixture {
        _dir: dir,
        vhosts,
        dump_program,
        backup_root,
    }
}

fn run(fixture: &Fixture) -> Vec<BackupResult> {
    let sites = sites::discover(&LocalConfig::new(vec![fixture.vhosts.clone()])).unwrap();
    assert_eq!(sites.len(), 1);

    let backup = LocalBackup::new(
        BackupLayout::new(&fixture.backup_root),
        ArchiveEngine::default(),
        DatabaseDumper::new(&fixture.dump_program),
        RetentionPolicy::default(),
    );
    let mut results = backup.run(&sites);
    results.sort_by_key(|r| r.kind != ArtifactKind::Files);
    results
}

fn created(result: &BackupResult) -> &Path {
    match &result.status {
        UnitStatus::Created { path } => path,
        other => panic!("{} backup not created: {other}", result.kind),
    }
}

fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<_> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn site_is_archived_and_dumped() {
    let fixture = fixture();
    let results = run(&fixture);
    assert_eq!(results.len(), 2);

    let site_dir = fixture.backup_root.join("app.example.com");
    let archive = created(&results[0]);
    assert_eq!(archive.parent().unwrap(), site_dir);
    let name = archive.file_name().unwrap().to_string_lossy();
    assert!(name.starts_with("files_") && name.ends_with(".tar.gz"), "{name}");

    let dump = created(&results[1]);
    assert_eq!(dump.parent().unwrap(), site_dir.join("database"));
    let name = dump.file_name().unwrap().to_string_lossy();
    assert!(name.starts_with("db_") && name.ends_with(".sql.gz"), "{name}");

    // nothing but the artifacts is left behind
    assert_eq!(file_names(&site_dir).len(), 2);
    assert_eq!(file_names(&site_dir.join("database")).len(), 1);

    let restored = TempDir::new().unwrap();
    ArchiveEngine::default().extract(archive, restored.path()).unwrap();
    assert_eq!(
        fs::read_to_string(restored.path().join("public/index.php")).unwrap(),
        "<?php echo 'hello';\n"
    );
    assert!(restored.path().join(".env").is_file());
    assert!(!restored.path().join("node_modules").exists());

    assert!(Summary::new(BackupMode::Local, results).is_success());
}

#[test]
fn unchanged_site_is_only_dumped_again() {
    let fixture = fixture();
    let first = run(&fixture);
    created(&first[0]);

    let second = run(&fixture);
    assert_eq!(second.len(), 2);
    assert_eq!(second[0].kind, ArtifactKind::Files);
    assert_eq!(second[0].status, UnitStatus::Unchanged);
    assert_eq!(second[1].kind, ArtifactKind::Database);
    created(&second[1]);

    let archives: Vec<_> = file_names(&fixture.backup_root.join("app.example.com"))
        .into_iter()
        .filter(|name| name.starts_with("files_"))
        .collect();
    assert_eq!(archives.len(), 1);
}

#[test]
fn document_roots_sharing_a_name_never_share_a_backup_dir() {
    let fixture = fixture();
    let other_root = fixture.vhosts.parent().unwrap().join("srv/app-copy");
    fs::create_dir_all(&other_root).unwrap();
    fs::write(other_root.join("index.html"), "copy\n").unwrap();
    let mut vhosts = fs::read_to_string(&fixture.vhosts).unwrap();
    vhosts.push_str(&format!(
        "<VirtualHost *:443>\n    ServerName app.example.com\n    DocumentRoot {}\n</VirtualHost>\n",
        other_root.display()
    ));
    fs::write(&fixture.vhosts, vhosts).unwrap();

    let results = run(&fixture);
    let archives: Vec<_> = results.iter().filter(|r| r.kind == ArtifactKind::Files).collect();
    assert_eq!(archives.len(), 1);

    let restored = TempDir::new().unwrap();
    ArchiveEngine::default().extract(created(archives[0]), restored.path()).unwrap();
    assert!(restored.path().join("public/index.php").is_file());
    assert!(!restored.path().join("index.html").exists());
}
