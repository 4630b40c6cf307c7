use std::fmt;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex_lite::Regex;

use crate::cluster::AppAttempt;
use crate::error::{DebugError, Result};
use crate::http::HttpClient;

/// The JDWP announcement, older JVMs print a bare port, JDK 9+ may print
/// `host:port` or `*:port`.
const LISTENING_PATTERN: &str = r"Listening for transport dt_socket at address:\s*(?:\S*:)?(\d+)";

fn listening_regex() -> &'static Regex {
    static LISTENING: OnceLock<Regex> = OnceLock::new();
    LISTENING.get_or_init(|| Regex::new(LISTENING_PATTERN).expect("valid listening pattern"))
}

/// Where a remote debugger attaches to the spark driver
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DebugEndpoint {
    pub host: String,
    pub port: u16,
}

impl DebugEndpoint {
    pub fn jdb_command(&self) -> String {
        format!("jdb -attach {}:{}", self.host, self.port)
    }
}

impl fmt::Display for DebugEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Fetches the raw text of a container log
#[async_trait]
pub trait DriverLogSource: Send + Sync {
    async fn fetch_log(&self, url: &str) -> Result<String>;
}

#[async_trait]
impl DriverLogSource for HttpClient {
    async fn fetch_log(&self, url: &str) -> Result<String> {
        self.get_text(url).await
    }
}

/// Host part of a `host:port` address, split on the last colon.
///
/// `None` when there is no colon or nothing before it; callers decide whether
/// that is fatal.
pub fn parse_am_host(http_address: &str) -> Option<&str> {
    match http_address.rsplit_once(':') {
        Some((host, _)) if !host.is_empty() => Some(host),
        _ => None,
    }
}

/// The driver's stdout page, derived from the attempt's container log link.
pub fn driver_log_url(attempt: &AppAttempt) -> Result<String> {
    match attempt.container_logs() {
        Some(link) => Ok(format!("{}/stdout/?start=0", link.trim_end_matches('/'))),
        None => Err(DebugError::NoLogsLink {
            attempt_id: attempt.attempt_id().to_string(),
        }),
    }
}

/// Host of the attempt's application master.
///
/// A blank address means the master container is not placed yet and is
/// retryable, an address without a usable host is not.
pub fn am_host(attempt: &AppAttempt) -> Result<&str> {
    let address = attempt.am_address().ok_or_else(|| DebugError::NoAmAddress {
        attempt_id: attempt.attempt_id().to_string(),
    })?;
    parse_am_host(address).ok_or_else(|| DebugError::MalformedAmAddress {
        address: address.to_string(),
    })
}

/// Port of the first debug agent announcement in `log`.
///
/// Only the first announcement counts, a number there that does not fit a
/// port means no port.
pub fn parse_listening_port(log: &str) -> Option<u16> {
    let regex = listening_regex();
    let captures = log.lines().find_map(|line| regex.captures(line))?;
    captures.get(1)?.as_str().parse::<u16>().ok()
}

pub async fn fetch_log_and_parse_port(source: &dyn DriverLogSource, log_url: &str) -> Result<u16> {
    let log = source.fetch_log(log_url).await?;
    tracing::trace!(url = log_url, bytes = log.len(), "Fetched driver log");

    parse_listening_port(&log).ok_or_else(|| DebugError::PortNotFound {
        url: log_url.to_string(),
    })
}

/// Runs the endpoint steps against one attempt: log url, host, port.
pub async fn resolve_endpoint(
    attempt: &AppAttempt,
    source: &dyn DriverLogSource,
) -> Result<DebugEndpoint> {
    let log_url = driver_log_url(attempt)?;
    let host = am_host(attempt)?;
    let port = fetch_log_and_parse_port(source, &log_url).await?;

    Ok(DebugEndpoint {
        host: host.to_string(),
        port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticLog(&'static str);

    #[async_trait]
    impl DriverLogSource for StaticLog {
        async fn fetch_log(&self, _url: &str) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    const DRIVER_LOG: &str = "\
Log Type: stdout
Log Upload Time: Mon Oct 12 10:01:02 +0000 2026
Log Length: 61
Listening for transport dt_socket at address: 5005
23/10/12 10:01:03 INFO SparkContext: Running Spark version 3.3.0
";

    fn attempt(address: &str, logs_link: Option<&str>) -> AppAttempt {
        AppAttempt {
            id: "1".to_string(),
            app_attempt_id: Some("appattempt_1_0001_000001".to_string()),
            node_http_address: Some(address.to_string()),
            logs_link: logs_link.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn am_host_is_before_the_last_colon() {
        assert_eq!(parse_am_host("10.0.0.5:41230"), Some("10.0.0.5"));
        assert_eq!(parse_am_host("wn0.cluster:30060"), Some("wn0.cluster"));
        assert_eq!(parse_am_host("[fe80::1]:8042"), Some("[fe80::1]"));
        assert_eq!(parse_am_host("wn0.cluster"), None);
        assert_eq!(parse_am_host(":8042"), None);
        assert_eq!(parse_am_host(""), None);
    }

    #[test]
    fn log_url_points_at_stdout() {
        let url = driver_log_url(&attempt(
            "wn0:30060",
            Some("http://wn0:30060/node/containerlogs/container_1/livy/"),
        ))
        .unwrap();
        assert_eq!(
            url,
            "http://wn0:30060/node/containerlogs/container_1/livy/stdout/?start=0"
        );
    }

    #[test]
    fn missing_logs_link() {
        for link in [None, Some(""), Some("   ")] {
            let err = driver_log_url(&attempt("wn0:30060", link)).unwrap_err();
            assert!(matches!(err, DebugError::NoLogsLink { .. }));
        }
    }

    #[test]
    fn port_from_listening_line() {
        assert_eq!(parse_listening_port(DRIVER_LOG), Some(5005));
        assert_eq!(
            parse_listening_port("Listening for transport dt_socket at address: *:39417"),
            Some(39417)
        );
        assert_eq!(
            parse_listening_port(
                "<pre>Listening for transport dt_socket at address: wn0.cluster:40001</pre>"
            ),
            Some(40001)
        );
    }

    #[test]
    fn first_announcement_wins() {
        let log = "\
noise
Listening for transport dt_socket at address: 41000
Listening for transport dt_socket at address: 42000
";
        assert_eq!(parse_listening_port(log), Some(41000));
    }

    #[test]
    fn out_of_range_announcement_is_no_port() {
        let log = "\
Listening for transport dt_socket at address: 99999
Listening for transport dt_socket at address: 41000
";
        assert_eq!(parse_listening_port(log), None);
    }

    #[test]
    fn no_port_among_unrelated_lines() {
        let log = "INFO starting\nListening for transport shmem at address: javadebug\nWARN done\n";
        assert_eq!(parse_listening_port(log), None);
        assert_eq!(parse_listening_port(""), None);
    }

    #[tokio::test]
    async fn fetch_and_parse() {
        let port = fetch_log_and_parse_port(&StaticLog(DRIVER_LOG), "http://wn0/stdout")
            .await
            .unwrap();
        assert_eq!(port, 5005);

        let err = fetch_log_and_parse_port(&StaticLog("INFO nothing yet\n"), "http://wn0/stdout")
            .await
            .unwrap_err();
        assert!(matches!(err, DebugError::PortNotFound { ref url } if url == "http://wn0/stdout"));
    }

    #[tokio::test]
    async fn endpoint_from_attempt() {
        let endpoint = resolve_endpoint(
            &attempt(
                "10.0.0.5:41230",
                Some("http://10.0.0.5:8042/node/containerlogs/container_1/livy"),
            ),
            &StaticLog(DRIVER_LOG),
        )
        .await
        .unwrap();
        assert_eq!(
            endpoint,
            DebugEndpoint {
                host: "10.0.0.5".to_string(),
                port: 5005
            }
        );
        assert_eq!(endpoint.to_string(), "10.0.0.5:5005");
        assert_eq!(endpoint.jdb_command(), "jdb -attach 10.0.0.5:5005");
    }

    #[tokio::test]
    async fn malformed_address_is_not_retryable() {
        let err = resolve_endpoint(
            &attempt("no-port-here", Some("http://wn0/logs")),
            &StaticLog(DRIVER_LOG),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DebugError::MalformedAmAddress { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn early_attempt_is_not_ready() {
        // the master container is not placed yet, both fields are blank
        let err = resolve_endpoint(&attempt("", Some("")), &StaticLog(DRIVER_LOG))
            .await
            .unwrap_err();
        assert!(matches!(err, DebugError::NoLogsLink { .. }));
        assert!(err.is_retryable());

        let err = resolve_endpoint(
            &attempt("  ", Some("http://wn0/logs")),
            &StaticLog(DRIVER_LOG),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            DebugError::NoAmAddress { ref attempt_id } if attempt_id == "appattempt_1_0001_000001"
        ));
        assert!(err.is_retryable());
    }
}
