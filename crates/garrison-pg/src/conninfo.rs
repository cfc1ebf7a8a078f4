//! Connection parameters in libpq keyword/value form.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{PgError, PgResult};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5432;
pub const DEFAULT_DBNAME: &str = "postgres";
pub const DEFAULT_USER: &str = "postgres";

/// Parameters for one PostgreSQL backend.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnInfo {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: Option<String>,
    pub application_name: Option<String>,
    pub connect_timeout: Option<Duration>,
}

impl Default for ConnInfo {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            dbname: DEFAULT_DBNAME.to_string(),
            user: DEFAULT_USER.to_string(),
            password: None,
            application_name: None,
            connect_timeout: None,
        }
    }
}

// Keeps the password out of logs.
impl fmt::Debug for ConnInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnInfo")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("dbname", &self.dbname)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "********"))
            .field("application_name", &self.application_name)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl fmt::Display for ConnInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "host={} port={} dbname={} user={}",
            quote(&self.host),
            self.port,
            quote(&self.dbname),
            quote(&self.user)
        )?;
        if let Some(name) = &self.application_name {
            write!(f, " application_name={}", quote(name))?;
        }
        Ok(())
    }
}

impl ConnInfo {
    /// Parses a `keyword=value` string. Values may be single-quoted; inside
    /// quotes `\'` and `\\` are escapes. Unknown keywords are ignored.
    pub fn parse(input: &str) -> PgResult<Self> {
        let mut info = Self::default();
        for (key, value) in tokenize(input)? {
            info.apply(&key, value)?;
        }
        Ok(info)
    }

    /// Sets a single parameter by keyword.
    pub fn apply(&mut self, key: &str, value: String) -> PgResult<()> {
        match key {
            "host" | "hostaddr" => self.host = value,
            "port" => {
                self.port = value
                    .parse()
                    .map_err(|_| PgError::ConnInfo(format!("invalid port \"{value}\"")))?;
            }
            "dbname" => self.dbname = value,
            "user" => self.user = value,
            "password" => self.password = Some(value),
            "application_name" => self.application_name = Some(value),
            "connect_timeout" => {
                let secs: u64 = value.parse().map_err(|_| {
                    PgError::ConnInfo(format!("invalid connect_timeout \"{value}\""))
                })?;
                self.connect_timeout = (secs > 0).then(|| Duration::from_secs(secs));
            }
            other => tracing::debug!(keyword = other, "ignoring connection parameter"),
        }
        Ok(())
    }

    /// `true` when the parameters are obviously unusable.
    pub fn is_obviously_invalid(&self) -> bool {
        self.host.is_empty() || self.port == 0 || self.user.is_empty() || self.dbname.is_empty()
    }

    /// A host beginning with `/` names the directory of a Unix-domain socket.
    pub fn is_unix_socket(&self) -> bool {
        self.host.starts_with('/')
    }

    /// Path of the Unix-domain socket, when [`is_unix_socket`](Self::is_unix_socket).
    pub fn socket_path(&self) -> Option<PathBuf> {
        self.is_unix_socket()
            .then(|| PathBuf::from(&self.host).join(format!(".s.PGSQL.{}", self.port)))
    }

    /// Startup parameters sent to the server.
    pub fn startup_params(&self) -> Vec<(&str, &str)> {
        let mut params = vec![
            ("user", self.user.as_str()),
            ("database", self.dbname.as_str()),
            ("client_encoding", "UTF8"),
        ];
        if let Some(name) = &self.application_name {
            params.push(("application_name", name.as_str()));
        }
        params
    }
}

fn quote(value: &str) -> String {
    if !value.is_empty() && !value.contains([' ', '\'', '\\']) {
        return value.to_string();
    }
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{escaped}'")
}

fn tokenize(input: &str) -> PgResult<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(c) = chars.next_if(|c| *c != '=' && !c.is_whitespace()) {
            key.push(c);
        }
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.next() != Some('=') {
            return Err(PgError::ConnInfo(format!(
                "missing \"=\" after \"{key}\" in connection info string"
            )));
        }
        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        let mut value = String::new();
        if chars.next_if_eq(&'\'').is_some() {
            loop {
                match chars.next() {
                    Some('\\') => {
                        if let Some(c) = chars.next() {
                            value.push(c);
                        }
                    }
                    Some('\'') => break,
                    Some(c) => value.push(c),
                    None => {
                        return Err(PgError::ConnInfo(
                            "unterminated quoted string in connection info string".to_string(),
                        ));
                    }
                }
            }
        } else {
            while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                value.push(c);
            }
        }
        pairs.push((key, value));
    }

    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_defaults() {
        let info = ConnInfo::default();
        assert_eq!(info.host, "localhost");
        assert_eq!(info.port, 5432);
        assert_eq!(info.dbname, "postgres");
        assert_eq!(info.user, "postgres");
    }

    #[test]
    fn test_parse_keywords_and_quotes() {
        let info = ConnInfo::parse(
            "host=db.local port=6432 dbname=app user=svc password='p a\\'ss' application_name=web",
        )
        .expect("valid conninfo");
        assert_eq!(info.host, "db.local");
        assert_eq!(info.port, 6432);
        assert_eq!(info.dbname, "app");
        assert_eq!(info.user, "svc");
        assert_eq!(info.password.as_deref(), Some("p a'ss"));
        assert_eq!(info.application_name.as_deref(), Some("web"));
    }

    #[test_case("host"; "missing equals")]
    #[test_case("password='open"; "unterminated quote")]
    #[test_case("port=abc"; "bad port")]
    fn rejects_malformed(input: &str) {
        assert!(ConnInfo::parse(input).is_err());
    }

    #[test]
    fn test_display_omits_password() {
        let mut info = ConnInfo::default();
        info.password = Some("secret".to_string());
        info.application_name = Some("my app".to_string());
        let text = info.to_string();
        assert!(!text.contains("secret"));
        assert!(text.contains("application_name='my app'"));
        assert!(!format!("{info:?}").contains("secret"));
    }

    #[test]
    fn test_unix_socket_path() {
        let info = ConnInfo::parse("host=/var/run/postgresql port=5433").expect("valid");
        assert!(info.is_unix_socket());
        assert_eq!(
            info.socket_path(),
            Some(PathBuf::from("/var/run/postgresql/.s.PGSQL.5433"))
        );
    }
}
