//! Request heuristics that flag scanners before any authentication happens.

use super::request::{ConnectTargetError, HttpMethod, RequestHead, parse_connect_target};
use crate::security::ScanType;

/// Header substrings typical of scanners and probes, matched case-insensitively
const SUSPICIOUS_PATTERNS: &[(&str, &[&str])] = &[
    (
        "user-agent",
        &["sqlmap", "nikto", "nmap", "nessus", "metasploit", "wpscan", "acunetix"],
    ),
    ("host", &["localhost", "127.0.0.1", "0.0.0.0", "::1"]),
    ("referer", &["javascript:", "data:", "file://"]),
    (
        "content-type",
        &["application/x-www-form-urlencoded", "multipart/form-data"],
    ),
];

/// Violation is a detected probe and the 400 message it is answered with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub scan_type: ScanType,
    pub message: &'static str,
}

/// detect_protocol_attack checks the method and, for CONNECT, the target authority
pub fn detect_protocol_attack(head: &RequestHead) -> Option<Violation> {
    let Some(method) = head.known_method() else {
        return Some(Violation {
            scan_type: ScanType::InvalidHttpMethod,
            message: "Invalid HTTP Method",
        });
    };

    if method == HttpMethod::Connect {
        match parse_connect_target(&head.target) {
            Ok(_) => (),
            Err(ConnectTargetError::Malformed) => {
                return Some(Violation {
                    scan_type: ScanType::MalformedConnect,
                    message: "Malformed CONNECT Request",
                });
            }
            Err(ConnectTargetError::InvalidPort) => {
                return Some(Violation {
                    scan_type: ScanType::InvalidPort,
                    message: "Invalid Port Number",
                });
            }
        }
    }

    None
}

/// suspicious_headers lists `name: value` for every header matching a pattern
pub fn suspicious_headers(head: &RequestHead) -> Vec<String> {
    SUSPICIOUS_PATTERNS
        .iter()
        .filter_map(|(name, patterns)| {
            let value = head.header(name)?.to_ascii_lowercase();
            patterns
                .iter()
                .any(|p| value.contains(p))
                .then(|| format!("{name}: {value}"))
        })
        .collect()
}
