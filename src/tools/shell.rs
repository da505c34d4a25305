//! The Shell Sandbox: `python` / `pip` / `curl`, path- and command-scoped (spec §4.F).
//!
//! `python` and `pip` are spawned as child processes (the reference source runs them
//! in-process so scripts can import a helper library colocated under `<root>/lib`;
//! design note §9 permits spawning instead, as long as the output-capture contract and
//! cwd-pinning rule are preserved). `curl` is implemented as an in-process HTTP client,
//! exactly as spec'd — no external binary is ever invoked for it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::errors::{MethingsError, Result};

const MAX_OUTPUT_BYTES: usize = 1024 * 1024;
const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecOutput {
    pub status: String,
    pub code: i32,
    pub output: String,
}

/// Pin `cwd` under `root`; any attempt to escape is silently pinned back to the root
/// (spec §4.F), never surfaced as an error.
fn pin_cwd(root: &Path, cwd: &str) -> PathBuf {
    if cwd.is_empty() {
        return root.to_path_buf();
    }
    let joined = root.join(cwd.trim_start_matches('/'));
    let normalized = lexical_normalize(&joined);
    let root_resolved = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    if normalized.starts_with(&root_resolved) || normalized == root_resolved {
        normalized
    } else {
        root.to_path_buf()
    }
}

fn lexical_normalize(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                if matches!(components.last(), Some(std::path::Component::Normal(_))) {
                    components.pop();
                }
            }
            std::path::Component::CurDir => {}
            other => components.push(other),
        }
    }
    components.iter().collect()
}

fn truncate_at_utf8_boundary(data: &[u8], max: usize) -> &[u8] {
    if max >= data.len() {
        return data;
    }
    let mut end = max;
    while end > 0 && (data[end] & 0xC0) == 0x80 {
        end -= 1;
    }
    &data[..end]
}

fn combine_output(stdout: &[u8], stderr: &[u8]) -> (String, bool) {
    let combined_len = stdout.len() + stderr.len();
    let truncated = combined_len > MAX_OUTPUT_BYTES;
    let stderr_reserve = (MAX_OUTPUT_BYTES / 4).min(stderr.len());
    let stdout_max = MAX_OUTPUT_BYTES - stderr_reserve;
    let stdout_capped = if stdout.len() > stdout_max {
        truncate_at_utf8_boundary(stdout, stdout_max)
    } else {
        stdout
    };
    let remaining = MAX_OUTPUT_BYTES.saturating_sub(stdout_capped.len());
    let stderr_capped = if stderr.len() > remaining {
        truncate_at_utf8_boundary(stderr, remaining)
    } else {
        stderr
    };
    let mut out = String::from_utf8_lossy(stdout_capped).to_string();
    out.push_str(&String::from_utf8_lossy(stderr_capped));
    if truncated {
        out.push_str("\n[output truncated at 1MB]");
    }
    (out, truncated)
}

/// `Exec(cmd, raw_args, cwd) -> {status, code, output}` (spec §4.F).
pub async fn exec(root: &Path, cmd: &str, raw_args: &str, cwd: &str) -> Result<ExecOutput> {
    match cmd {
        "python" => exec_python(root, raw_args, cwd).await,
        "pip" => exec_pip(root, raw_args, cwd).await,
        "curl" => exec_curl(root, raw_args).await,
        _ => Err(MethingsError::CommandNotAllowed),
    }
}

async fn run_child(mut command: Command, pinned_cwd: &Path) -> Result<ExecOutput> {
    command.current_dir(pinned_cwd);
    command.kill_on_drop(true);
    match tokio::time::timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS), command.output()).await {
        Ok(Ok(output)) => {
            let (text, _truncated) = combine_output(&output.stdout, &output.stderr);
            Ok(ExecOutput {
                status: if output.status.success() { "ok".to_string() } else { "error".to_string() },
                code: output.status.code().unwrap_or(-1),
                output: text,
            })
        }
        Ok(Err(e)) => Ok(ExecOutput {
            status: "error".to_string(),
            code: 1,
            output: format!("failed to spawn: {e}"),
        }),
        Err(_) => Ok(ExecOutput {
            status: "error".to_string(),
            code: 1,
            output: "command timed out".to_string(),
        }),
    }
}

async fn exec_python(root: &Path, raw_args: &str, cwd: &str) -> Result<ExecOutput> {
    let pinned_cwd = pin_cwd(root, cwd);
    let args = shlex::split(raw_args).unwrap_or_default();

    if args.is_empty() {
        return Ok(ExecOutput {
            status: "error".to_string(),
            code: 1,
            output: "python: interactive/no-arg form is not supported".to_string(),
        });
    }
    if args[0] == "-" {
        return Ok(ExecOutput {
            status: "error".to_string(),
            code: 1,
            output: "python: reading from stdin ('-') is not supported".to_string(),
        });
    }

    let mut command = Command::new("python3");
    // The reference interpreter prepends `<root>/lib` to the module search path so
    // scripts can import a colocated helper library.
    command.env("PYTHONPATH", root.join("lib"));

    if args[0] == "-V" || args[0] == "--version" {
        command.arg("--version");
    } else if args[0] == "-c" {
        command.arg("-c").arg(args.get(1).cloned().unwrap_or_default());
    } else {
        command.arg(&args[0]);
        for extra in &args[1..] {
            command.arg(extra);
        }
    }

    run_child(command, &pinned_cwd).await
}

async fn exec_pip(root: &Path, raw_args: &str, cwd: &str) -> Result<ExecOutput> {
    let pinned_cwd = pin_cwd(root, cwd);
    let mut args: Vec<String> = shlex::split(raw_args).unwrap_or_default();

    // Force binary-only resolution on install unless the caller already opted out.
    if args.first().map(String::as_str) == Some("install")
        && !args.iter().any(|a| a == "--no-binary" || a == "--only-binary")
    {
        args.push("--only-binary".to_string());
        args.push(":all:".to_string());
    }

    // Heuristically drop an ambiguous `uvc` package name paired with a known-good one.
    let mut note = String::new();
    if args.iter().filter(|a| !a.starts_with('-')).count() > 2 {
        if let Some(pos) = args.iter().position(|a| a == "uvc") {
            args.remove(pos);
            note = "note: dropped ambiguous package name 'uvc'\n".to_string();
        }
    }

    let tmp_dir = pinned_cwd.join(".tmp");
    let cache_dir = pinned_cwd.join(".cache").join("pip");
    let _ = std::fs::create_dir_all(&tmp_dir);
    let _ = std::fs::create_dir_all(&cache_dir);

    let mut command = Command::new("pip");
    command.env("TMPDIR", &tmp_dir);
    command.env("PIP_CACHE_DIR", &cache_dir);
    command.args(&args);

    let mut result = run_child(command, &pinned_cwd).await?;
    if !note.is_empty() {
        result.output = format!("{note}{}", result.output);
    }
    Ok(result)
}

// --- curl emulator ---

#[derive(Default)]
struct CurlOptions {
    silent: bool,
    show_error: bool,
    insecure: bool,
    fail: bool,
    fail_with_body: bool,
    head_only: bool,
    include_headers: bool,
    write_out: Option<String>,
    method: Option<String>,
    headers: Vec<(String, String)>,
    body: Option<String>,
    json_body: bool,
    output: Option<String>,
    url: Option<String>,
}

fn parse_curl_args(raw_args: &str) -> CurlOptions {
    let tokens = shlex::split(raw_args).unwrap_or_default();
    let mut opts = CurlOptions::default();
    let mut i = 0;
    while i < tokens.len() {
        let tok = tokens[i].as_str();
        match tok {
            "-s" | "--silent" => opts.silent = true,
            "-S" | "--show-error" => opts.show_error = true,
            "-k" | "--insecure" => opts.insecure = true,
            "-L" | "--location" => {}
            "-f" | "--fail" => opts.fail = true,
            "--fail-with-body" => opts.fail_with_body = true,
            "-I" | "--head" => opts.head_only = true,
            "-i" | "--include" => opts.include_headers = true,
            "-w" | "--write-out" => {
                i += 1;
                opts.write_out = tokens.get(i).cloned();
            }
            "-X" | "--request" => {
                i += 1;
                opts.method = tokens.get(i).cloned();
            }
            "-H" | "--header" => {
                i += 1;
                if let Some(h) = tokens.get(i) {
                    if let Some((k, v)) = h.split_once(':') {
                        opts.headers.push((k.trim().to_string(), v.trim().to_string()));
                    }
                }
            }
            "-d" | "--data" | "--data-raw" => {
                i += 1;
                opts.body = tokens.get(i).cloned();
            }
            "--json" => {
                i += 1;
                opts.body = tokens.get(i).cloned();
                opts.json_body = true;
            }
            "-o" | "--output" => {
                i += 1;
                opts.output = tokens.get(i).cloned();
            }
            other => {
                // Short flag grouping for {s, S, L, f, I, i}
                if let Some(rest) = other.strip_prefix('-') {
                    if !rest.is_empty()
                        && !rest.starts_with('-')
                        && rest.chars().all(|c| "sSLfIi".contains(c))
                    {
                        for c in rest.chars() {
                            match c {
                                's' => opts.silent = true,
                                'S' => opts.show_error = true,
                                'L' => {}
                                'f' => opts.fail = true,
                                'I' => opts.head_only = true,
                                'i' => opts.include_headers = true,
                                _ => {}
                            }
                        }
                        i += 1;
                        continue;
                    }
                }
                if !other.starts_with('-') && opts.url.is_none() {
                    opts.url = Some(other.to_string());
                }
            }
        }
        i += 1;
    }
    opts
}

fn apply_write_out_template(tmpl: &str, status: u16, url: &str, size: usize, time_total: f64) -> String {
    let mut out = tmpl
        .replace("%{http_code}", &status.to_string())
        .replace("%{response_code}", &status.to_string())
        .replace("%{url_effective}", url)
        .replace("%{size_download}", &size.to_string())
        .replace("%{time_total}", &format!("{time_total:.6}"));
    out = out.replace("\\n", "\n").replace("\\r", "\r").replace("\\t", "\t");
    out
}

async fn exec_curl(root: &Path, raw_args: &str) -> Result<ExecOutput> {
    let opts = parse_curl_args(raw_args);
    let Some(url) = opts.url.clone() else {
        return Ok(ExecOutput {
            status: "error".to_string(),
            code: 2,
            output: "curl: no URL specified".to_string(),
        });
    };

    let mut method = opts.method.clone().unwrap_or_else(|| "GET".to_string());
    if opts.body.is_some() && opts.method.is_none() {
        method = "POST".to_string();
    }
    if opts.head_only {
        method = "HEAD".to_string();
    }

    let client_builder = reqwest::Client::builder().danger_accept_invalid_certs(opts.insecure);
    let client = client_builder.build().map_err(|e| anyhow::anyhow!(e))?;

    let mut builder = client.request(
        method.parse().unwrap_or(reqwest::Method::GET),
        &url,
    );
    for (k, v) in &opts.headers {
        builder = builder.header(k, v);
    }
    if opts.json_body {
        builder = builder.header("Content-Type", "application/json");
    }
    if let Some(body) = &opts.body {
        builder = builder.body(body.clone());
    }

    let start = std::time::Instant::now();
    let response = match builder.send().await {
        Ok(resp) => resp,
        Err(e) => {
            return Ok(ExecOutput {
                status: "error".to_string(),
                code: 1,
                output: format!("curl: (1) {e}"),
            });
        }
    };

    let status = response.status();
    let headers = response.headers().clone();
    let body_bytes = response.bytes().await.unwrap_or_default();
    let time_total = start.elapsed().as_secs_f64();

    let is_http_error = status.is_client_error() || status.is_server_error();
    if opts.fail && !opts.fail_with_body && is_http_error {
        return Ok(ExecOutput {
            status: "error".to_string(),
            code: 22,
            output: format!(
                "curl: (22) The requested URL returned error: {}",
                status.as_u16()
            ),
        });
    }

    let mut out = String::new();
    if opts.include_headers || opts.head_only {
        out.push_str(&format!(
            "HTTP/1.1 {} {}\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        ));
        for (name, value) in headers.iter() {
            out.push_str(&format!("{}: {}\r\n", name, value.to_str().unwrap_or("")));
        }
        out.push_str("\r\n");
    }
    if !opts.head_only {
        if let Some(output_path) = &opts.output {
            if output_path != "/dev/null" {
                let target = match super::filesystem::resolve_write_target_for_shell(root, output_path) {
                    Ok(path) => path,
                    Err(_) => {
                        return Ok(ExecOutput {
                            status: "error".to_string(),
                            code: 1,
                            output: "curl: (1) output path escapes the user root".to_string(),
                        })
                    }
                };
                if let Some(parent) = target.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                let _ = std::fs::write(&target, &body_bytes);
            }
        } else {
            out.push_str(&String::from_utf8_lossy(&body_bytes));
        }
    }

    if let Some(tmpl) = &opts.write_out {
        out.push_str(&apply_write_out_template(
            tmpl,
            status.as_u16(),
            &url,
            body_bytes.len(),
            time_total,
        ));
    }

    Ok(ExecOutput {
        status: "ok".to_string(),
        code: 0,
        output: out,
    })
}
