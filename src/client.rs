use crate::paths::Paths;
use crate::pid;
use crate::protocol::{self, ProtocolError, Request, Response};
use color_eyre::eyre::{Context, bail};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

/// True when a live daemon owns this data directory and its socket exists.
pub fn daemon_available(paths: &Paths) -> color_eyre::Result<bool> {
    Ok(pid::is_daemon_running(paths)? && paths.socket_file().exists())
}

/// One request per connection, one newline-terminated response back.
pub fn send_request(paths: &Paths, request: &Request) -> color_eyre::Result<Response> {
    let mut stream = connect_with_retry(paths, 10, Duration::from_millis(200))?;

    let encoded = protocol::encode_request(request)?;
    stream.write_all(&encoded)?;
    stream.shutdown(std::net::Shutdown::Write)?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader
        .read_line(&mut line)
        .context("failed to read daemon response")?;
    if line.trim().is_empty() {
        return Err(ProtocolError::EmptyResponse.into());
    }

    Ok(protocol::decode_response(&line)?)
}

fn connect_with_retry(
    paths: &Paths,
    retries: u32,
    delay: Duration,
) -> color_eyre::Result<UnixStream> {
    let socket = paths.socket_file();

    let mut attempt = 0;
    loop {
        match UnixStream::connect(&socket) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                attempt += 1;
                if attempt >= retries {
                    bail!("failed to connect to daemon after {retries} attempts: {e}");
                }
                std::thread::sleep(delay);
            }
        }
    }
}
