// SPDX-License-Identifier: GPL-3.0-or-later

use assert_cmd::Command;
use predicates::prelude::*;
use std::error::Error;
use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use tempfile::{tempdir, TempDir};

const QUINCY_BIN: &str = "quincy";

/// A work directory with crash reports and a configuration file.
struct Workspace {
    root: TempDir,
}

impl Workspace {
    fn new(reports: &[&str]) -> Result<Self, Box<dyn Error>> {
        let root = tempdir()?;
        fs::create_dir_all(root.path().join("reports"))?;
        for name in reports {
            let content = format!("Process: Example\nVersion: 1.4.2 (1402)\n\nThread 0 crashed in {name}\n");
            fs::write(root.path().join("reports").join(name), content)?;
        }
        Ok(Self { root })
    }

    fn config(&self, url: &str) -> Result<PathBuf, Box<dyn Error>> {
        let path = self.root.path().join("quincy.yml");
        let content = format!(
            r#"
schema: 1.0

submission:
  url: "{url}"
  timeout_secs: 5

application:
  name: Example
  version: "1402"
  short_version: 1.4.2
  identifier: com.example.app

diagnostics:
  directories: [reports]
  state_file: state/processed.json

consent:
  company_name: Example Inc.
"#
        );
        fs::write(&path, content)?;
        Ok(path)
    }

    fn quincy(&self, config: &Path) -> Result<Command, Box<dyn Error>> {
        let mut cmd = Command::cargo_bin(QUINCY_BIN)?;
        cmd.current_dir(self.root.path()).arg("--config").arg(config);
        // The test server is on the loopback interface.
        for key in ["HTTP_PROXY", "http_proxy", "HTTPS_PROXY", "https_proxy", "ALL_PROXY", "all_proxy"] {
            cmd.env_remove(key);
        }
        Ok(cmd)
    }
}

/// Answers a single HTTP request with the given body, and hands over the request body.
fn serve_once(answer: &'static str) -> Result<(String, mpsc::Receiver<String>), Box<dyn Error>> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let url = format!("http://{}/crash_v200.php", listener.local_addr()?);
    let (sender, receiver) = mpsc::channel();

    thread::spawn(move || {
        let Ok((stream, _)) = listener.accept() else { return };
        let mut reader = BufReader::new(stream);
        let mut content_length = 0;
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).unwrap_or(0) == 0 || line == "\r\n" {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                if name.eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().unwrap_or(0);
                }
            }
        }
        let mut body = vec![0; content_length];
        if reader.read_exact(&mut body).is_err() {
            return;
        }
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{answer}",
            answer.len()
        );
        let mut stream = reader.into_inner();
        let _ = stream.write_all(response.as_bytes());
        let _ = stream.flush();
        let _ = sender.send(String::from_utf8_lossy(&body).into_owned());
    });

    Ok((url, receiver))
}

#[test]
fn test_quincy_help() -> Result<(), Box<dyn Error>> {
    Command::cargo_bin(QUINCY_BIN)?
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage: quincy"));
    Ok(())
}

#[test]
fn test_exit_code_for_empty_arguments() -> Result<(), Box<dyn Error>> {
    Command::cargo_bin(QUINCY_BIN)?
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage: quincy"));
    Ok(())
}

#[test]
fn test_list_pending_reports() -> Result<(), Box<dyn Error>> {
    let workspace = Workspace::new(&[
        "Example_1.crash",
        "Example_2.ips",
        "Example-2024-05-01-101010.ips",
        "Other_1.crash",
        "Example_3.txt",
    ])?;
    let config = workspace.config("http://localhost/crash_v200.php")?;

    workspace
        .quincy(&config)?
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("Example_1.crash\tversion 1.4.2 (1402)"))
        .stdout(predicate::str::contains("Example_2.ips"))
        .stdout(predicate::str::contains("Example-2024-05-01-101010.ips"))
        .stdout(predicate::str::contains("Other_1.crash").not())
        .stdout(predicate::str::contains("3 pending crash reports"));
    Ok(())
}

#[test]
fn test_mark_reports_as_processed() -> Result<(), Box<dyn Error>> {
    let workspace = Workspace::new(&["Example_1.crash", "Example_2.crash"])?;
    let config = workspace.config("http://localhost/crash_v200.php")?;

    workspace.quincy(&config)?.args(["mark", "Example_1.crash"]).assert().success();

    workspace
        .quincy(&config)?
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("Example_1.crash").not())
        .stdout(predicate::str::contains("1 pending crash reports"));
    assert!(workspace.root.path().join("state/processed.json").exists());
    Ok(())
}

#[test]
fn test_submit_automatically() -> Result<(), Box<dyn Error>> {
    let workspace = Workspace::new(&["Example_1.crash"])?;
    let (url, requests) = serve_once("3")?;
    let config = workspace.config(&url)?;

    workspace
        .quincy(&config)?
        .args(["submit", "--auto", "--description", "pressed save"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1 of 1 reports sent"));

    let body = requests.recv()?;
    assert!(body.starts_with("xmlstring="));
    assert!(body.contains("pressed+save"));
    assert!(body.contains("Example_1.crash"));

    workspace
        .quincy(&config)?
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("0 pending crash reports"));
    Ok(())
}

#[test]
fn test_submit_rejected_by_server() -> Result<(), Box<dyn Error>> {
    let workspace = Workspace::new(&["Example_1.crash"])?;
    let (url, _requests) = serve_once("<result>-1</result>")?;
    let config = workspace.config(&url)?;

    workspace.quincy(&config)?.args(["submit", "--auto"]).assert().failure();

    workspace
        .quincy(&config)?
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("1 pending crash reports"));
    Ok(())
}

#[test]
fn test_submit_after_consent() -> Result<(), Box<dyn Error>> {
    let workspace = Workspace::new(&["Example_1.crash"])?;
    let (url, requests) = serve_once("2")?;
    let config = workspace.config(&url)?;

    workspace
        .quincy(&config)?
        .arg("submit")
        .write_stdin("yes\nit crashed on save\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("Send the crash reports to Example Inc.? [y/N]"));

    let body = requests.recv()?;
    assert!(body.contains("it+crashed+on+save"));
    Ok(())
}

#[test]
fn test_submit_needs_url() -> Result<(), Box<dyn Error>> {
    let workspace = Workspace::new(&["Example_1.crash"])?;
    let config = workspace.config("")?;

    workspace
        .quincy(&config)?
        .args(["submit", "--auto"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("submission.url"));
    Ok(())
}

#[test]
fn test_invalid_configuration() -> Result<(), Box<dyn Error>> {
    let workspace = Workspace::new(&[])?;
    let config = workspace.root.path().join("broken.yml");
    fs::write(&config, "schema: 1.0\nsubmission:\n  url: ftp://example.com\n")?;

    workspace
        .quincy(&config)?
        .arg("list")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Configuration validation failed"));
    Ok(())
}
