//! Host inspection used to explain TLS failures during subscription
//! downloads.

use itertools::Itertools;
use std::path::{Path, PathBuf};

#[cfg(windows)]
const OPENSSL_INSTALL_DIRS: &[&str] = &[
    "C:/Program Files/OpenSSL-Win64/bin",
    "C:/Program Files (x86)/OpenSSL-Win32/bin",
    "C:/OpenSSL-Win64/bin",
    "C:/OpenSSL-Win32/bin",
];

#[cfg(not(windows))]
const OPENSSL_INSTALL_DIRS: &[&str] = &[
    "/usr/lib",
    "/usr/lib64",
    "/usr/lib/x86_64-linux-gnu",
    "/usr/lib/aarch64-linux-gnu",
    "/usr/local/lib",
    "/opt/homebrew/lib",
    "/usr/local/opt/openssl/lib",
];

const CA_BUNDLE_CANDIDATES: &[&str] = &[
    "/etc/ssl/certs/ca-certificates.crt",
    "/etc/pki/tls/certs/ca-bundle.crt",
    "/etc/ssl/cert.pem",
    "/etc/ssl/ca-bundle.pem",
];

/// What the host looks like from a TLS point of view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsProbe {
    pub backend: Option<&'static str>,
    pub crypto_library: Option<PathBuf>,
    pub crypto_in_path: Vec<PathBuf>,
    pub ca_bundle: Option<PathBuf>,
}

impl TlsProbe {
    pub fn inspect_host() -> Self {
        let path_entries: Vec<PathBuf> = std::env::var_os("PATH")
            .map(|paths| std::env::split_paths(&paths).collect())
            .unwrap_or_default();

        let crypto_in_path = path_entries
            .into_iter()
            .filter(|dir| {
                dir.to_string_lossy().to_ascii_lowercase().contains("openssl") && dir.is_dir()
            })
            .collect();

        let ca_bundle = std::env::var_os("SSL_CERT_FILE")
            .map(PathBuf::from)
            .filter(|path| path.is_file())
            .or_else(|| {
                CA_BUNDLE_CANDIDATES
                    .iter()
                    .map(PathBuf::from)
                    .find(|path| path.is_file())
            });

        Self {
            backend: compiled_backend(),
            crypto_library: OPENSSL_INSTALL_DIRS
                .iter()
                .map(Path::new)
                .find_map(find_crypto_library),
            crypto_in_path,
            ca_bundle,
        }
    }
}

fn compiled_backend() -> Option<&'static str> {
    if cfg!(feature = "rustls") {
        Some("rustls")
    } else if cfg!(feature = "native-tls") {
        Some("native-tls")
    } else {
        None
    }
}

fn find_crypto_library(dir: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .find(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| {
                    name.starts_with("libssl.") || name.starts_with("libssl-") || name == "openssl.exe"
                })
        })
}

pub fn diagnose() -> String {
    render(&TlsProbe::inspect_host())
}

pub fn render(probe: &TlsProbe) -> String {
    let mut lines = vec!["TLS Diagnostics:".to_string()];

    match probe.backend {
        Some(backend) => lines.push(format!("- TLS support: Available ({})", backend)),
        None => {
            lines.push("- TLS support: NOT AVAILABLE".to_string());
            lines.push(
                "- This is likely the main issue. The application was built without TLS support."
                    .to_string(),
            );
        }
    }

    let needs_system_library = probe.backend == Some("native-tls");
    match &probe.crypto_library {
        Some(path) => lines.push(format!("- OpenSSL found at: {}", path.display())),
        None if needs_system_library => {
            lines.push("- OpenSSL installation: NOT FOUND in standard locations".to_string())
        }
        None => lines.push("- OpenSSL installation: not required by this build".to_string()),
    }

    if probe.crypto_in_path.is_empty() {
        lines.push("- OpenSSL not found in PATH environment variable".to_string());
    } else {
        lines.push(format!(
            "- OpenSSL in PATH: {}",
            probe.crypto_in_path.iter().map(|p| p.display()).join(", ")
        ));
    }

    match &probe.ca_bundle {
        Some(path) => lines.push(format!("- CA bundle: {}", path.display())),
        None => lines.push("- CA bundle: none found (set SSL_CERT_FILE)".to_string()),
    }

    let mut suggestions = Vec::new();
    if probe.backend.is_none() {
        suggestions.push("Rebuild with the `rustls` or `native-tls` feature enabled".to_string());
    }
    if needs_system_library && probe.crypto_library.is_none() {
        suggestions.push("Install OpenSSL with your system package manager".to_string());
    }
    if probe.ca_bundle.is_none() {
        suggestions.push(
            "Install the ca-certificates package or point SSL_CERT_FILE at a CA bundle"
                .to_string(),
        );
    }
    suggestions.push(
        "Check that the subscription server presents a certificate valid for its host name"
            .to_string(),
    );
    suggestions.push("Restart the application after installing missing components".to_string());

    lines.push(String::new());
    lines.push("Suggestions:".to_string());
    lines.extend(
        suggestions
            .iter()
            .enumerate()
            .map(|(i, suggestion)| format!("{}. {}", i + 1, suggestion)),
    );

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_without_backend() {
        let report = render(&TlsProbe::default());
        assert!(report.contains("TLS support: NOT AVAILABLE"));
        assert!(report.contains("1. Rebuild with the `rustls` or `native-tls` feature"));
        assert!(report.contains("CA bundle: none found"));
    }

    #[test]
    fn test_render_native_tls_missing_library() {
        let probe = TlsProbe {
            backend: Some("native-tls"),
            crypto_library: None,
            crypto_in_path: Vec::new(),
            ca_bundle: Some(PathBuf::from("/etc/ssl/cert.pem")),
        };
        let report = render(&probe);
        assert!(report.contains("TLS support: Available (native-tls)"));
        assert!(report.contains("OpenSSL installation: NOT FOUND"));
        assert!(report.contains("Install OpenSSL"));
        assert!(!report.contains("ca-certificates"));
    }

    #[test]
    fn test_render_healthy_rustls_host() {
        let probe = TlsProbe {
            backend: Some("rustls"),
            crypto_library: None,
            crypto_in_path: vec![PathBuf::from("/opt/openssl/bin")],
            ca_bundle: Some(PathBuf::from("/etc/ssl/certs/ca-certificates.crt")),
        };
        let report = render(&probe);
        assert!(report.contains("not required by this build"));
        assert!(report.contains("OpenSSL in PATH: /opt/openssl/bin"));
        assert!(report.contains("Restart the application"));
    }

    #[test]
    fn test_diagnose_reports_compiled_backend() {
        let report = diagnose();
        assert!(report.starts_with("TLS Diagnostics:"));
        assert!(report.contains("Suggestions:"));
    }
}
