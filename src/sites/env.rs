use std::fmt;

use super::apache::unquote;

/// Locations of the environment file relative to a document root, by priority.
pub const ENV_CANDIDATES: [&str; 9] = [
    ".env",
    "../.env",
    "../../.env",
    "../../../.env",
    "public/.env",
    "public_html/.env",
    "html/.env",
    "app/.env",
    "laravel/.env",
];

const DEFAULT_DB_HOST: &str = "localhost";

/// Connection parameters of a site's database.
#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub host: String,
    pub name: String,
    pub user: String,
    pub password: Option<String>,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("name", &self.name)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl fmt::Display for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "database {} on {} as {}", self.name, self.host, self.user)
    }
}

/// The database related values of an environment file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnvValues {
    pub db_host: Option<String>,
    pub db_database: Option<String>,
    pub db_username: Option<String>,
    pub db_password: Option<String>,
}

impl EnvValues {
    /// Parses `KEY=VALUE` lines.
    ///
    /// Comments, blank lines, malformed lines and unknown keys are skipped.
    /// Values are trimmed and one layer of quotes is removed. The first
    /// occurrence of a key wins.
    pub fn parse(contents: &str) -> Self {
        let mut values = Self::default();

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = line.strip_prefix("export ").unwrap_or(line);
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };

            let slot = match key.trim() {
                "DB_HOST" => &mut values.db_host,
                "DB_DATABASE" => &mut values.db_database,
                "DB_USERNAME" => &mut values.db_username,
                "DB_PASSWORD" => &mut values.db_password,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(unquote(value.trim()).to_string());
            }
        }

        values
    }

    /// Database configuration, if database name and user are present.
    pub fn database(&self) -> Option<DatabaseConfig> {
        let non_empty = |value: &Option<String>| value.as_deref().filter(|v| !v.is_empty()).map(str::to_string);

        Some(DatabaseConfig {
            host: non_empty(&self.db_host).unwrap_or_else(|| DEFAULT_DB_HOST.to_string()),
            name: non_empty(&self.db_database)?,
            user: non_empty(&self.db_username)?,
            password: non_empty(&self.db_password),
        })
    }
}
