use std::{collections::HashMap, path::Path, time::Duration};

use futures::future;
use tokio::{net::TcpStream, time};

use crate::{utils, MonoopsError};

use super::{CheckOutcome, HealthCheck, HealthCheckResult, HealthReport};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Runs `checks` concurrently and aggregates their outcomes.
///
/// Command checks run in `cwd` with `envs`. A check that outlives its timeout fails.
pub async fn evaluate_checks(
    http: &reqwest::Client,
    checks: &[HealthCheck],
    cwd: &Path,
    envs: &HashMap<String, String>,
    default_timeout: Duration,
) -> HealthReport {
    let results = future::join_all(
        checks
            .iter()
            .map(|check| evaluate_check(http, check, cwd, envs, default_timeout)),
    )
    .await;

    HealthReport::from_results(results)
}

async fn evaluate_check(
    http: &reqwest::Client,
    check: &HealthCheck,
    cwd: &Path,
    envs: &HashMap<String, String>,
    default_timeout: Duration,
) -> HealthCheckResult {
    let timeout = check.timeout(default_timeout);
    let started = time::Instant::now();

    let (outcome, message) = match check {
        HealthCheck::Http {
            url,
            expected_status,
            ..
        } => check_http(http, url, *expected_status, timeout).await,
        HealthCheck::Tcp { host, port, .. } => check_tcp(host, *port, timeout).await,
        HealthCheck::Command { command, .. } => check_command(command, cwd, envs, timeout).await,
    };

    tracing::debug!(?check, ?outcome, %message, "health check finished");

    HealthCheckResult {
        check: check.clone(),
        outcome,
        message,
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

async fn check_http(
    http: &reqwest::Client,
    url: &str,
    expected: u16,
    timeout: Duration,
) -> (CheckOutcome, String) {
    let url = match reqwest::Url::parse(url) {
        Ok(url) => url,
        Err(e) => return (CheckOutcome::Unknown, format!("invalid url {}: {}", url, e)),
    };

    match http.get(url).timeout(timeout).send().await {
        Ok(response) if response.status().as_u16() == expected => {
            (CheckOutcome::Pass, format!("status {}", expected))
        }
        Ok(response) => (
            CheckOutcome::Fail,
            format!("status {}, expected {}", response.status().as_u16(), expected),
        ),
        Err(e) if e.is_timeout() => (
            CheckOutcome::Fail,
            format!("timed out after {}s", timeout.as_secs()),
        ),
        Err(e) => (CheckOutcome::Fail, e.to_string()),
    }
}

async fn check_tcp(host: &str, port: u16, timeout: Duration) -> (CheckOutcome, String) {
    match time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => (CheckOutcome::Pass, format!("connected to {}:{}", host, port)),
        Ok(Err(e)) => (CheckOutcome::Fail, format!("{}:{}: {}", host, port, e)),
        Err(_) => (
            CheckOutcome::Fail,
            format!("{}:{} timed out after {}s", host, port, timeout.as_secs()),
        ),
    }
}

async fn check_command(
    command: &str,
    cwd: &Path,
    envs: &HashMap<String, String>,
    timeout: Duration,
) -> (CheckOutcome, String) {
    match utils::run_shell(command, cwd, envs, timeout).await {
        Ok(output) if output.success() => (CheckOutcome::Pass, "exit 0".to_string()),
        Ok(output) => (
            CheckOutcome::Fail,
            format!(
                "exit {}: {}",
                output
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".into()),
                output.combined().trim()
            ),
        ),
        Err(e @ MonoopsError::Timeout { .. }) => (CheckOutcome::Fail, e.to_string()),
        Err(e) => (CheckOutcome::Unknown, e.to_string()),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;
    use crate::deployment::HealthStatus;

    /// Answers every request with `status`, returning the URL to poll.
    async fn serve(status: &'static str) -> anyhow::Result<String> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let url = format!("http://{}/health", listener.local_addr()?);
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut request = [0u8; 1024];
                let _ = stream.read(&mut request).await;
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                    status
                );
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
        Ok(url)
    }

    fn http(url: &str, expected_status: u16) -> HealthCheck {
        HealthCheck::Http {
            url: url.to_string(),
            expected_status,
            timeout_secs: Some(5),
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_http_check_compares_status() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let client = reqwest::Client::new();
        let ok = serve("200 OK").await?;
        let unavailable = serve("503 Service Unavailable").await?;

        let run = |checks: Vec<HealthCheck>| {
            let client = client.clone();
            let cwd = dir.path().to_path_buf();
            async move {
                evaluate_checks(&client, &checks, &cwd, &HashMap::new(), Duration::from_secs(5)).await
            }
        };

        let report = run(vec![http(&ok, 200)]).await;
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.results[0].outcome, CheckOutcome::Pass);

        let report = run(vec![http(&ok, 200), http(&unavailable, 200)]).await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.results[1].outcome, CheckOutcome::Fail);
        assert_eq!(report.results[1].message, "status 503, expected 200");

        // A maintenance page can be the expected answer.
        let report = run(vec![http(&unavailable, 503)]).await;
        assert_eq!(report.status, HealthStatus::Healthy);
        Ok(())
    }

    #[tokio::test]
    async fn test_command_and_tcp_checks() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("ready"), "")?;
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();

        let checks = vec![
            HealthCheck::Command {
                command: "test -f ready".into(),
                timeout_secs: None,
            },
            HealthCheck::Tcp {
                host: "127.0.0.1".into(),
                port,
                timeout_secs: Some(2),
            },
        ];

        let report = evaluate_checks(
            &reqwest::Client::new(),
            &checks,
            dir.path(),
            &HashMap::new(),
            Duration::from_secs(5),
        )
        .await;

        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.results.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_failing_and_unevaluable_checks() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let http = reqwest::Client::new();

        let failing = vec![HealthCheck::Command {
            command: "exit 2".into(),
            timeout_secs: None,
        }];
        let report =
            evaluate_checks(&http, &failing, dir.path(), &HashMap::new(), Duration::from_secs(5))
                .await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(report.results[0].message.starts_with("exit 2"));

        let mixed = vec![
            HealthCheck::Command {
                command: "true".into(),
                timeout_secs: None,
            },
            HealthCheck::Http {
                url: "not a url".into(),
                expected_status: 200,
                timeout_secs: None,
            },
        ];
        let report =
            evaluate_checks(&http, &mixed, dir.path(), &HashMap::new(), Duration::from_secs(5))
                .await;
        assert_eq!(report.status, HealthStatus::Degraded);

        let report =
            evaluate_checks(&http, &[], dir.path(), &HashMap::new(), Duration::from_secs(5)).await;
        assert_eq!(report.status, HealthStatus::Unknown);
        Ok(())
    }
}
