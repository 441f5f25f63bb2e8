//! Classification of transport and syscall failures into the closed
//! [`NetworkErrorKind`] set, plus the retryable HTTP status set.

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};

/// The closed set of network-level failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkErrorKind {
    Timeout,
    ConnectionRefused,
    ConnectionReset,
    DnsFailure,
    NetworkUnreachable,
    TemporaryNetwork,
    Permanent,
    Unknown,
}

impl NetworkErrorKind {
    /// Whether an error of this kind is worth retrying.
    ///
    /// DNS failures and permanent errors are not: retrying a name that does
    /// not resolve or a request the server definitively rejected wastes the
    /// retry budget. Context cancellation never reaches this function; it is
    /// handled before classification.
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::DnsFailure | Self::Permanent)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ConnectionRefused => "connection_refused",
            Self::ConnectionReset => "connection_reset",
            Self::DnsFailure => "dns_failure",
            Self::NetworkUnreachable => "network_unreachable",
            Self::TemporaryNetwork => "temporary_network",
            Self::Permanent => "permanent",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP statuses that indicate a transient condition worth retrying.
pub const RETRYABLE_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Whether an HTTP status is in the retryable set.
pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUSES.contains(&status)
}

/// Classify a [`reqwest::Error`] into the closed kind set.
pub fn classify_reqwest(err: &reqwest::Error) -> NetworkErrorKind {
    if err.is_timeout() {
        return NetworkErrorKind::Timeout;
    }
    if err.is_connect() {
        // reqwest folds DNS and TCP connect failures together; the io
        // source distinguishes them when present.
        if let Some(io_err) = find_io_source(err) {
            return classify_io(io_err);
        }
        let text = err.to_string();
        if text.contains("dns") || text.contains("resolve") {
            return NetworkErrorKind::DnsFailure;
        }
        return NetworkErrorKind::ConnectionRefused;
    }
    if err.is_request() || err.is_body() {
        if let Some(io_err) = find_io_source(err) {
            return classify_io(io_err);
        }
        return NetworkErrorKind::TemporaryNetwork;
    }
    if err.is_builder() || err.is_redirect() || err.is_decode() {
        return NetworkErrorKind::Permanent;
    }
    NetworkErrorKind::Unknown
}

/// Classify a raw I/O error into the closed kind set.
pub fn classify_io(err: &io::Error) -> NetworkErrorKind {
    use io::ErrorKind::*;
    match err.kind() {
        TimedOut => NetworkErrorKind::Timeout,
        ConnectionRefused => NetworkErrorKind::ConnectionRefused,
        ConnectionReset | ConnectionAborted | BrokenPipe => NetworkErrorKind::ConnectionReset,
        NetworkUnreachable | HostUnreachable | NetworkDown => NetworkErrorKind::NetworkUnreachable,
        AddrNotAvailable | NotFound => NetworkErrorKind::DnsFailure,
        Interrupted | WouldBlock => NetworkErrorKind::TemporaryNetwork,
        PermissionDenied | InvalidInput | InvalidData | Unsupported => NetworkErrorKind::Permanent,
        _ => NetworkErrorKind::Unknown,
    }
}

/// Walk the error source chain looking for an `io::Error`.
fn find_io_source<'a>(err: &'a (dyn std::error::Error + 'static)) -> Option<&'a io::Error> {
    let mut source = err.source();
    while let Some(inner) = source {
        if let Some(io_err) = inner.downcast_ref::<io::Error>() {
            return Some(io_err);
        }
        source = inner.source();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds_exclude_dns_and_permanent() {
        assert!(NetworkErrorKind::Timeout.is_retryable());
        assert!(NetworkErrorKind::ConnectionRefused.is_retryable());
        assert!(NetworkErrorKind::ConnectionReset.is_retryable());
        assert!(NetworkErrorKind::NetworkUnreachable.is_retryable());
        assert!(NetworkErrorKind::TemporaryNetwork.is_retryable());
        assert!(NetworkErrorKind::Unknown.is_retryable());

        assert!(!NetworkErrorKind::DnsFailure.is_retryable());
        assert!(!NetworkErrorKind::Permanent.is_retryable());
    }

    #[test]
    fn retryable_status_set_is_exact() {
        for status in [408, 429, 500, 502, 503, 504] {
            assert!(is_retryable_status(status), "{status} should be retryable");
        }
        for status in [200, 201, 301, 304, 400, 401, 403, 404, 410, 422, 501] {
            assert!(!is_retryable_status(status), "{status} should not be retryable");
        }
    }

    #[test]
    fn io_classification_covers_common_kinds() {
        let cases = [
            (io::ErrorKind::TimedOut, NetworkErrorKind::Timeout),
            (
                io::ErrorKind::ConnectionRefused,
                NetworkErrorKind::ConnectionRefused,
            ),
            (
                io::ErrorKind::ConnectionReset,
                NetworkErrorKind::ConnectionReset,
            ),
            (io::ErrorKind::BrokenPipe, NetworkErrorKind::ConnectionReset),
            (
                io::ErrorKind::PermissionDenied,
                NetworkErrorKind::Permanent,
            ),
            (io::ErrorKind::Interrupted, NetworkErrorKind::TemporaryNetwork),
        ];
        for (kind, expected) in cases {
            let err = io::Error::new(kind, "test");
            assert_eq!(classify_io(&err), expected, "{kind:?}");
        }
    }

    #[test]
    fn kind_display_matches_serde_names() {
        assert_eq!(NetworkErrorKind::DnsFailure.to_string(), "dns_failure");
        let json = serde_json::to_string(&NetworkErrorKind::ConnectionReset).unwrap();
        assert_eq!(json, "\"connection_reset\"");
    }
}
