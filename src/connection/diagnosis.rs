//! Best-effort reachability diagnosis run after a failed connection
//! attempt: DNS resolution, ICMP ping, and a raw TCP connect.
//!
//! Every probe here is best-effort: a failure here never changes the error
//! already returned to the caller, it only annotates it with structured log
//! lines and a descriptive summary.

use std::net::IpAddr;
use std::time::Duration;

use hickory_resolver::TokioResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use tokio::net::TcpStream;
use tracing::warn;

/// The outcome of each diagnosis step, all of which are best-effort.
#[derive(Debug, Clone, Default)]
pub struct DiagnosisReport {
    /// Resolved addresses, if DNS resolution succeeded within budget.
    pub resolved: Vec<IpAddr>,
    /// Whether an ICMP echo reply was received within budget.
    pub ping_ok: Option<bool>,
    /// Whether a raw TCP connect to the target port succeeded within
    /// budget.
    pub tcp_ok: Option<bool>,
}

impl DiagnosisReport {
    /// A one-line human summary suitable for appending to a connection
    /// error message.
    #[must_use]
    pub fn summary(&self) -> String {
        let dns = if self.resolved.is_empty() {
            "dns: unresolved".to_owned()
        } else {
            format!("dns: {} address(es)", self.resolved.len())
        };
        let ping = match self.ping_ok {
            Some(true) => "ping: ok",
            Some(false) => "ping: failed",
            None => "ping: skipped",
        };
        let tcp = match self.tcp_ok {
            Some(true) => "tcp: ok",
            Some(false) => "tcp: failed",
            None => "tcp: skipped",
        };
        format!("{dns}, {ping}, {tcp}")
    }
}

/// Runs DNS resolution (5s), ICMP ping (10s), then a raw TCP connect (5s),
/// in that order, against `host`/`port`. Every step is independently
/// best-effort; a failure in one does not prevent the next from running.
pub async fn diagnose(host: &str, port: u16) -> DiagnosisReport {
    let mut report = DiagnosisReport::default();

    report.resolved = resolve(host).await;
    if report.resolved.is_empty() {
        warn!(host, "diagnosis: DNS resolution found no addresses");
    }

    if let Some(addr) = report.resolved.first().copied() {
        report.ping_ok = Some(ping(addr).await);
    }

    if let Some(addr) = report.resolved.first().copied() {
        report.tcp_ok = Some(tcp_connect(addr, port).await);
    }

    report
}

async fn resolve(host: &str) -> Vec<IpAddr> {
    if let Ok(addr) = host.parse::<IpAddr>() {
        return vec![addr];
    }
    let Ok(resolver) = TokioResolver::builder_with_config(
        ResolverConfig::default(),
        hickory_resolver::name_server::TokioConnectionProvider::default(),
    )
    .map(|mut builder| {
        *builder.options_mut() = ResolverOpts::default();
        builder.build()
    }) else {
        return Vec::new();
    };

    match tokio::time::timeout(Duration::from_secs(5), resolver.lookup_ip(host)).await {
        Ok(Ok(lookup)) => lookup.iter().collect(),
        Ok(Err(err)) => {
            warn!(host, error = %err, "diagnosis: DNS lookup failed");
            Vec::new()
        }
        Err(_elapsed) => {
            warn!(host, "diagnosis: DNS lookup timed out");
            Vec::new()
        }
    }
}

async fn ping(addr: IpAddr) -> bool {
    use surge_ping::{Client, Config, PingIdentifier, PingSequence};

    let config = Config::default();
    let Ok(client) = Client::new(&config) else {
        return false;
    };
    let Ok(mut pinger) = client.pinger(addr, PingIdentifier(rand_id())).await else {
        return false;
    };
    pinger.timeout(Duration::from_secs(10));
    let payload = [0_u8; 8];
    matches!(
        tokio::time::timeout(
            Duration::from_secs(10),
            pinger.ping(PingSequence(0), &payload)
        )
        .await,
        Ok(Ok(_))
    )
}

#[expect(
    clippy::cast_possible_truncation,
    reason = "only used as a low-stakes ICMP identifier, truncation is harmless"
)]
fn rand_id() -> u16 {
    // A fixed, process-stable identifier is sufficient here: this is a
    // one-shot diagnostic ping, not a long-lived session distinguishing
    // concurrent pingers.
    std::process::id() as u16
}

async fn tcp_connect(addr: IpAddr, port: u16) -> bool {
    tokio::time::timeout(Duration::from_secs(5), TcpStream::connect((addr, port)))
        .await
        .is_ok_and(|r| r.is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn summary_reports_skipped_steps() {
        let report = DiagnosisReport::default();
        assert_eq!(report.summary(), "dns: unresolved, ping: skipped, tcp: skipped");
    }

    #[rstest]
    fn summary_reports_resolved_count() {
        let report = DiagnosisReport {
            resolved: vec!["127.0.0.1".parse().expect("valid ip")],
            ping_ok: Some(true),
            tcp_ok: Some(false),
        };
        assert_eq!(report.summary(), "dns: 1 address(es), ping: ok, tcp: failed");
    }

    #[tokio::test]
    async fn diagnose_handles_literal_ip_without_dns() {
        let report = diagnose("127.0.0.1", 1).await;
        assert_eq!(report.resolved, vec!["127.0.0.1".parse::<IpAddr>().expect("ip")]);
    }
}
