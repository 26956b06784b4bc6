//! Locust script materialization

use crate::models::{InterfaceScenario, TestTask};
use std::collections::HashSet;
use std::fmt::Write;

const HEADER: &str = "\
import json

from locust import HttpUser, task, between


class GeneratedUser(HttpUser):
    wait_time = between(1, 2)
";

/// Build a Locust user class from a task's interface scenarios. Weight maps
/// to `@task(weight)`; with no scenarios the script hits `/`.
pub fn synthesize(task: &TestTask, scenarios: &[InterfaceScenario]) -> String {
    let mut script = String::from(HEADER);

    if scenarios.is_empty() {
        let name = format!("{} root", task.name);
        script.push_str(&render_request(
            1,
            "index",
            "GET",
            "/",
            &name,
            None,
            None,
            30,
        ));
        return script;
    }

    let mut taken = HashSet::new();
    for scenario in scenarios {
        let func = unique_identifier(&scenario.interface_name, &mut taken);
        let headers = (!scenario.headers.is_empty())
            .then(|| serde_json::to_string(&scenario.headers).unwrap_or_else(|_| "{}".into()));
        script.push_str(&render_request(
            scenario.weight.max(1),
            &func,
            &scenario.method,
            &scenario.interface_url,
            &scenario.interface_name,
            headers.as_deref(),
            scenario.body.as_deref(),
            scenario.timeout_secs,
        ));
    }

    script
}

#[allow(clippy::too_many_arguments)]
fn render_request(
    weight: u32,
    func: &str,
    method: &str,
    url: &str,
    name: &str,
    headers: Option<&str>,
    body: Option<&str>,
    timeout_secs: u64,
) -> String {
    let method = method.trim().to_ascii_uppercase();
    let mut args = vec![py_str(url)];

    if let Some(body) = body.filter(|b| !b.trim().is_empty()) {
        if serde_json::from_str::<serde_json::Value>(body).is_ok() {
            args.push(format!("json=json.loads({})", py_str(body)));
        } else {
            args.push(format!("data={}", py_str(body)));
        }
    }
    if let Some(headers) = headers {
        args.push(format!("headers={}", headers));
    }
    args.push(format!("name={}", py_str(name)));
    args.push(format!("timeout={}", timeout_secs.max(1)));

    let call = match method.as_str() {
        "GET" | "POST" | "PUT" | "PATCH" | "DELETE" => {
            format!("self.client.{}({})", method.to_ascii_lowercase(), args.join(", "))
        }
        other => format!("self.client.request({}, {})", py_str(other), args.join(", ")),
    };

    let mut out = String::new();
    let _ = write!(
        out,
        "\n    @task({weight})\n    def {func}(self):\n        {call}\n"
    );
    out
}

/// Python string literal. JSON string escapes are valid Python escapes.
fn py_str(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".into())
}

/// Lowercase Python keywords plus `HttpUser` members a task method would shadow
const RESERVED_NAMES: &[&str] = &[
    "and", "as", "assert", "async", "await", "break", "class", "continue", "def", "del", "elif",
    "else", "except", "finally", "for", "from", "global", "if", "import", "in", "is", "lambda",
    "nonlocal", "not", "or", "pass", "raise", "return", "try", "while", "with", "yield",
    "client", "environment", "host", "on_start", "on_stop", "tasks", "wait_time", "weight",
];

fn unique_identifier(name: &str, taken: &mut HashSet<String>) -> String {
    let mut base: String = name
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    base = base.trim_matches('_').to_string();

    if base.is_empty()
        || base.starts_with(|c: char| c.is_ascii_digit())
        || RESERVED_NAMES.contains(&base.as_str())
    {
        base = format!("task_{}", base);
    }

    let mut candidate = base.clone();
    let mut n = 2;
    while !taken.insert(candidate.clone()) {
        candidate = format!("{}_{}", base, n);
        n += 1;
    }
    candidate
}
