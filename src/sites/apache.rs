use std::sync::LazyLock;

use regex::Regex;

static SERVER_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^ServerName\s+(\S+)").expect("ServerName regex should be valid"));
static DOCUMENT_ROOT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^DocumentRoot\s+(.+)$").expect("DocumentRoot regex should be valid")
});
static BLOCK_BOUNDARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^</?VirtualHost(\s|>|$)").expect("VirtualHost regex should be valid")
});

/// A `ServerName` paired with the `DocumentRoot` following it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VirtualHost {
    pub server_name: String,
    pub document_root: String,
}

/// Extracts the virtual hosts of one configuration fragment.
///
/// Directives are matched case-insensitively. A `DocumentRoot` only yields a
/// [VirtualHost] if a `ServerName` was seen before it in the same block.
/// The name is consumed by the pairing and by every `<VirtualHost>` boundary.
pub fn parse_virtual_hosts(contents: &str) -> Vec<VirtualHost> {
    let mut hosts = Vec::new();
    let mut server_name: Option<String> = None;

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if BLOCK_BOUNDARY.is_match(line) {
            server_name = None;
            continue;
        }

        if let Some(captures) = SERVER_NAME.captures(line) {
            server_name = Some(captures[1].to_string());
            continue;
        }

        if let Some(captures) = DOCUMENT_ROOT.captures(line) {
            let Some(name) = server_name.take() else {
                log::trace!(target: "backup::sites", "Ignoring DocumentRoot without ServerName: {line}");
                continue;
            };
            hosts.push(VirtualHost {
                server_name: name,
                document_root: unquote(captures[1].trim()).to_string(),
            });
        }
    }

    hosts
}

/// Strips one layer of matching single or double quotes.
pub(crate) fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}
