//! Ready-condition waiter.
//!
//! Conditions are evaluated sequentially: DNS resolution, HTTP GET
//! answering 2xx/3xx, or a fixed delay. Each condition has a total
//! wait budget and an inter-probe pause; timeout fails the condition.

use super::params::{expand_string, CapturedOutputs, ExpansionContext, LockedParameters};
use super::types::ReadyCondition;
use std::collections::HashMap;
use std::net::ToSocketAddrs;
use std::time::{Duration, Instant};

const DEFAULT_WAIT_SECONDS: u64 = 1200;
const DEFAULT_PAUSE_SECONDS: u64 = 10;

/// Evaluate ready conditions against the current parameters and
/// outputs. `wait_override` caps the per-condition budget (the `--wait`
/// flag). The first failing condition aborts the rest.
pub fn wait_for_ready_conditions(
    conditions: &[ReadyCondition],
    parameters: &LockedParameters,
    outputs: &CapturedOutputs,
    wait_override: Option<u64>,
) -> Result<(), String> {
    let environment = HashMap::new();
    let ctx = ExpansionContext {
        parameters,
        outputs,
        environment: &environment,
        component: "",
        depends: &[],
    };

    for condition in conditions {
        let wait = match (condition.wait_seconds, wait_override) {
            (0, Some(w)) => w,
            (0, None) => DEFAULT_WAIT_SECONDS,
            (w, Some(cap)) => w.min(cap),
            (w, None) => w,
        };
        let pause = if condition.pause_seconds > 0 {
            condition.pause_seconds
        } else {
            DEFAULT_PAUSE_SECONDS
        };

        if !condition.dns.is_empty() {
            let host = expand_string(&condition.dns, &ctx)
                .map_err(|errs| format!("ready condition dns: {}", errs.join("; ")))?;
            probe_until(wait, pause, &format!("dns `{}`", host), || dns_resolves(&host))?;
        } else if !condition.url.is_empty() {
            let url = expand_string(&condition.url, &ctx)
                .map_err(|errs| format!("ready condition url: {}", errs.join("; ")))?;
            probe_until(wait, pause, &format!("url `{}`", url), || http_get_ok(&url))?;
        } else if condition.pause_seconds > 0 {
            std::thread::sleep(Duration::from_secs(condition.pause_seconds));
        }
    }
    Ok(())
}

/// Run a probe until it succeeds or the budget expires.
fn probe_until(
    wait_seconds: u64,
    pause_seconds: u64,
    what: &str,
    probe: impl Fn() -> bool,
) -> Result<(), String> {
    let deadline = Instant::now() + Duration::from_secs(wait_seconds);
    loop {
        if probe() {
            return Ok(());
        }
        let now = Instant::now();
        if now + Duration::from_secs(pause_seconds) > deadline {
            return Err(format!(
                "ready condition {} not satisfied within {}s",
                what, wait_seconds
            ));
        }
        std::thread::sleep(Duration::from_secs(pause_seconds));
    }
}

fn dns_resolves(host: &str) -> bool {
    (host, 0u16).to_socket_addrs().map(|mut addrs| addrs.next().is_some()).unwrap_or(false)
}

fn http_get_ok(url: &str) -> bool {
    let client = match reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(10))
        .redirect(reqwest::redirect::Policy::none())
        .build()
    {
        Ok(c) => c,
        Err(_) => return false,
    };
    match client.get(url).send() {
        Ok(response) => {
            let status = response.status();
            status.is_success() || status.is_redirection()
        }
        Err(_) => false,
    }
}
