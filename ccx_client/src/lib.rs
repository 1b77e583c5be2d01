#![deny(clippy::unwrap_used)]

use std::{
    io::{BufRead, BufReader, Read, Write},
    os::unix::net::UnixStream,
    process::{Command, Stdio, exit},
};

use ccx_shared::CompilerKind;

// Entry point shared by every ccx_* multicall binary.
pub fn wrap_command(binary: CompilerKind) {
    let args = std::env::args_os().skip(1).collect::<Vec<_>>();
    let Ok(cwd) = std::env::current_dir() else {
        eprintln!("Failed to get current directory");
        exit(1);
    };
    let env_path = std::env::var_os("PATH");

    let socket_path = std::env::var("CCX_SOCKET")
        .map(|s| ccx_shared::paths::expand_tilde(&s))
        .unwrap_or_else(|_| ccx_shared::paths::expand_tilde(ccx_shared::paths::DEFAULT_SOCKET_PATH));

    let request = ccx_shared::RunRequestData {
        binary,
        args: args.clone(),
        cwd,
        env_path,
    };

    match send_request(&socket_path, &request.to_wire()) {
        Ok(response) => handle_response(response),
        Err(err) => {
            eprintln!(
                "Cannot reach ccx_daemon at {}, running locally instead ({err})",
                socket_path.display()
            );
            run_locally(binary, &args);
        }
    }
}

// Hand-rolled HTTP/1.1 request/reply: just enough framing to talk to the
// daemon's socket, not a general client.
fn send_request(
    socket_path: &std::path::Path,
    request: &ccx_shared::RunRequestDataWire,
) -> anyhow::Result<ccx_shared::RunResponseDataWire> {
    let body = serde_json::to_vec(request)?;
    let mut stream = UnixStream::connect(socket_path)?;

    write!(
        stream,
        "POST /run HTTP/1.1\r\n\
         Host: localhost\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n",
        body.len()
    )?;
    stream.write_all(&body)?;
    stream.flush()?;

    let mut reader = BufReader::new(stream);
    let mut status_line = String::new();
    reader.read_line(&mut status_line)?;
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| anyhow::anyhow!("malformed status line: {status_line:?}"))?;

    let mut content_length = None;
    loop {
        let mut header_line = String::new();
        reader.read_line(&mut header_line)?;
        let trimmed = header_line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse::<usize>().ok();
            }
        }
    }

    let mut body = vec![0u8; content_length.unwrap_or(0)];
    reader.read_exact(&mut body)?;

    if status != 200 {
        anyhow::bail!(
            "daemon returned status {status}: {}",
            String::from_utf8_lossy(&body)
        );
    }
    if body.is_empty() {
        // The daemon sends an empty 200 when the client that originally
        // asked disconnected before a reply was ready. Since we're that
        // client and are clearly still here, treat it as "nothing to do".
        exit(0);
    }
    Ok(serde_json::from_slice(&body)?)
}

fn handle_response(data: ccx_shared::RunResponseDataWire) {
    let Ok(data) = ccx_shared::RunResponseData::from_wire(data) else {
        eprintln!("Failed to decode response");
        exit(1);
    };
    std::io::stdout().write_all(&data.stdout).ok();
    std::io::stderr().write_all(&data.stderr).ok();
    exit(data.status);
}

// Used when the daemon isn't reachable at all; never attempts remote.
fn run_locally(binary: CompilerKind, args: &[std::ffi::OsString]) -> ! {
    let binary_name = binary.to_standard_binary_name();
    let child = Command::new(&binary_name)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn();
    match child {
        Ok(mut child) => match child.wait() {
            Ok(status) => exit(status.code().unwrap_or(1)),
            Err(err) => {
                eprintln!("Failed to wait on {binary_name:?}: {err}");
                exit(1);
            }
        },
        Err(err) => {
            eprintln!("Failed to spawn {binary_name:?}: {err}");
            exit(1);
        }
    }
}
