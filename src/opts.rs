//! Connection and registry options.

use url::Url;

use crate::error::Error;

/// SSL connection mode.
///
/// TLS negotiation is not performed by this crate; modes that demand
/// encryption are rejected when a connection is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Don't use SSL
    Disable,
    /// Plain text, accepted as a fallback
    #[default]
    Prefer,
    /// Require SSL connection
    Require,
}

impl SslMode {
    fn parse(value: &str) -> Result<Self, Error> {
        match value {
            "disable" => Ok(SslMode::Disable),
            "allow" | "prefer" => Ok(SslMode::Prefer),
            "require" | "verify-ca" | "verify-full" => Ok(SslMode::Require),
            _ => Err(Error::Config(format!(
                "Invalid sslmode: expected one of ['disable', 'allow', 'prefer', 'require', 'verify-ca', 'verify-full'], got {}",
                value
            ))),
        }
    }
}

/// Options for one PostgreSQL connection, parsed from a connection target.
#[derive(Debug, Clone)]
pub struct Opts {
    /// Hostname or IP address.
    ///
    /// Default: `"localhost"`
    pub host: String,

    /// Port number for the PostgreSQL server.
    ///
    /// Default: `5432`
    pub port: u16,

    /// Unix socket directory.
    ///
    /// Default: `None`
    pub socket_dir: Option<String>,

    /// Username for authentication.
    ///
    /// Default: `$USER`
    pub user: String,

    /// Database name to use.
    ///
    /// Default: `None` (the server uses the user name)
    pub database: Option<String>,

    /// Password for authentication.
    ///
    /// Default: `None`
    pub password: Option<String>,

    /// Application name to report to the server.
    ///
    /// Default: `Some("pgmode")`
    pub application_name: Option<String>,

    /// SSL connection mode.
    ///
    /// Default: `SslMode::Prefer`
    pub ssl_mode: SslMode,

    /// Additional startup parameters.
    ///
    /// Default: `[]`
    pub params: Vec<(String, String)>,
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            socket_dir: None,
            user: std::env::var("USER").unwrap_or_default(),
            database: None,
            password: None,
            application_name: Some("pgmode".to_string()),
            ssl_mode: SslMode::Prefer,
            params: Vec::new(),
        }
    }
}

impl Opts {
    /// Path of the Unix socket, if connecting through one.
    pub fn socket_path(&self) -> Option<String> {
        self.socket_dir
            .as_ref()
            .map(|dir| format!("{}/.s.PGSQL.{}", dir.trim_end_matches('/'), self.port))
    }

    /// Database the server will actually open.
    pub fn effective_database(&self) -> &str {
        self.database.as_deref().unwrap_or(&self.user)
    }

    /// Host as reported in connection metadata.
    pub fn display_host(&self) -> &str {
        self.socket_dir.as_deref().unwrap_or(&self.host)
    }

    fn set_host(&mut self, host: &str) {
        if host.starts_with('/') {
            self.socket_dir = Some(host.to_string());
        } else if !host.is_empty() {
            self.host = host.to_string();
            self.socket_dir = None;
        }
    }

    fn set_param(&mut self, key: &str, value: &str) -> Result<(), Error> {
        match key {
            "host" => self.set_host(value),
            "port" => {
                self.port = value
                    .parse()
                    .map_err(|_| Error::Config(format!("Invalid port: {}", value)))?;
            }
            "user" => self.user = value.to_string(),
            "password" => self.password = Some(value.to_string()),
            "dbname" => {
                self.database = (!value.is_empty()).then(|| value.to_string());
            }
            "sslmode" => self.ssl_mode = SslMode::parse(value)?,
            "application_name" => self.application_name = Some(value.to_string()),
            _ => self.params.push((key.to_string(), value.to_string())),
        }
        Ok(())
    }

    /// Parse a keyword/value connection string, e.g.
    /// `host=localhost port=5432 dbname='my db' user=postgres`.
    pub fn from_keyword_value(s: &str) -> Result<Self, Error> {
        let mut opts = Opts::default();
        for (key, value) in parse_keyword_value(s)? {
            opts.set_param(&key, &value)?;
        }
        Ok(opts)
    }
}

/// Split a keyword/value connection string into pairs.
fn parse_keyword_value(s: &str) -> Result<Vec<(String, String)>, Error> {
    let mut pairs = Vec::new();
    let mut chars = s.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            return Ok(pairs);
        }

        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c.is_whitespace() {
                break;
            }
            key.push(c);
            chars.next();
        }
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        if chars.next() != Some('=') {
            return Err(Error::Config(format!(
                "missing \"=\" after \"{}\" in connection info string",
                key
            )));
        }
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }

        let mut value = String::new();
        if chars.peek() == Some(&'\'') {
            chars.next();
            loop {
                match chars.next() {
                    Some('\\') => match chars.next() {
                        Some(escaped) => value.push(escaped),
                        None => break,
                    },
                    Some('\'') => break,
                    Some(c) => value.push(c),
                    None => {
                        return Err(Error::Config(
                            "unterminated quoted string in connection info string".into(),
                        ));
                    }
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                if c == '\\' {
                    chars.next();
                    if let Some(escaped) = chars.next() {
                        value.push(escaped);
                    }
                    continue;
                }
                value.push(c);
                chars.next();
            }
        }

        pairs.push((key, value));
    }
}

impl TryFrom<&Url> for Opts {
    type Error = Error;

    /// Parse a PostgreSQL connection URL.
    ///
    /// Format: `postgres://[user[:password]@]host[:port][/database][?param1=value1&param2=value2&..]`
    ///
    /// Supported query parameters:
    /// - `sslmode`: disable, allow, prefer, require, verify-ca, verify-full
    /// - `application_name`: application name
    /// - `host`: Unix socket directory (overrides the URL host)
    fn try_from(url: &Url) -> Result<Self, Self::Error> {
        if !["postgres", "postgresql", "pg"].contains(&url.scheme()) {
            return Err(Error::Config(format!(
                "Invalid scheme: expected 'postgres://' or 'pg://', got '{}://'",
                url.scheme()
            )));
        }

        let mut opts = Opts {
            port: url.port().unwrap_or(5432),
            password: url.password().map(|s| s.to_string()),
            database: url.path().strip_prefix('/').and_then(|s| {
                if s.is_empty() {
                    None
                } else {
                    Some(s.to_string())
                }
            }),
            ..Opts::default()
        };
        if let Some(host) = url.host_str() {
            opts.set_host(host);
        }
        if !url.username().is_empty() {
            opts.user = url.username().to_string();
        }

        for (key, value) in url.query_pairs() {
            opts.set_param(&key, &value)?;
        }

        Ok(opts)
    }
}

impl TryFrom<&str> for Opts {
    type Error = Error;

    /// Parse either a URL or a keyword/value connection string.
    fn try_from(s: &str) -> Result<Self, Self::Error> {
        let trimmed = s.trim();
        if trimmed.contains("://") {
            let url = Url::parse(trimmed).map_err(|e| Error::Config(format!("Invalid URL: {}", e)))?;
            Self::try_from(&url)
        } else {
            Self::from_keyword_value(trimmed)
        }
    }
}

/// What happens to callbacks whose request will never run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AbandonPolicy {
    /// Drop the callbacks without invoking them.
    #[default]
    Drop,
    /// Invoke each callback with [`Error::Cancelled`].
    Cancel,
}

/// Registry options.
#[derive(Debug, Clone, Default)]
pub struct RegistryOpts {
    /// Handling of queued (and, on explicit disconnect, in-flight) callbacks
    /// when a connection is torn down.
    ///
    /// Default: `AbandonPolicy::Drop`
    pub abandon: AbandonPolicy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_target() {
        let opts = Opts::try_from("postgres://alice:pw@db.example:6543/sales?sslmode=disable&search_path=app")
            .unwrap();
        assert_eq!(opts.host, "db.example");
        assert_eq!(opts.port, 6543);
        assert_eq!(opts.user, "alice");
        assert_eq!(opts.password.as_deref(), Some("pw"));
        assert_eq!(opts.database.as_deref(), Some("sales"));
        assert_eq!(opts.ssl_mode, SslMode::Disable);
        assert_eq!(opts.params, vec![("search_path".to_string(), "app".to_string())]);
    }

    #[test]
    fn url_socket_dir() {
        let opts = Opts::try_from("postgres://bob@localhost/notes?host=/var/run/postgresql").unwrap();
        assert_eq!(
            opts.socket_path().as_deref(),
            Some("/var/run/postgresql/.s.PGSQL.5432")
        );
        assert_eq!(opts.display_host(), "/var/run/postgresql");
    }

    #[test]
    fn keyword_value_target() {
        let opts = Opts::try_from(
            "host=localhost port=5433 user=carol dbname='my db' password='it\\'s' application_name=ed",
        )
        .unwrap();
        assert_eq!(opts.port, 5433);
        assert_eq!(opts.user, "carol");
        assert_eq!(opts.database.as_deref(), Some("my db"));
        assert_eq!(opts.password.as_deref(), Some("it's"));
        assert_eq!(opts.application_name.as_deref(), Some("ed"));
    }

    #[test]
    fn keyword_value_errors() {
        assert!(matches!(Opts::try_from("host localhost"), Err(Error::Config(_))));
        assert!(matches!(Opts::try_from("dbname='open"), Err(Error::Config(_))));
        assert!(matches!(Opts::try_from("port=abc"), Err(Error::Config(_))));
        assert!(matches!(Opts::try_from("sslmode=sometimes"), Err(Error::Config(_))));
    }

    #[test]
    fn bad_scheme() {
        assert!(matches!(Opts::try_from("mysql://localhost/db"), Err(Error::Config(_))));
    }

    #[test]
    fn effective_database_defaults_to_user() {
        let opts = Opts::try_from("user=dave").unwrap();
        assert_eq!(opts.effective_database(), "dave");
    }
}
