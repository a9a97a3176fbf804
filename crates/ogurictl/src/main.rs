//! Oguri control client
//!
//! Translates command-line arguments into a configuration payload and sends it
//! to the running daemon over its control socket.

use anyhow::{Context, Result, bail};
use oguri_ipc::{Request, output_request, socket_path};
use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::process::ExitCode;

const USAGE: &str = "Usage: ogurictl COMMAND
       ogurictl [--help] [--version]

Available commands:
  output NAME [<options>]
    --anchor        Sides to which the image should be anchored
    --filter        Scaling filter to apply to the image
    --image         Path to the image to show on this output
    --scaling-mode  Method used to fit the image to the output

  reload

General options:
  -V, --version   Show the version of oguri
  -h, --help      Show this text
";

/// Parse the arguments following `output`
fn parse_output(args: &[String]) -> Result<Request> {
    let Some((name, rest)) = args.split_first() else {
        bail!("No output name provided!");
    };

    let mut options = Vec::new();
    let mut iter = rest.iter();
    while let Some(arg) = iter.next() {
        let Some(flag) = arg.strip_prefix("--") else {
            bail!("unexpected argument '{arg}'");
        };

        // Accept both `--flag=value` and `--flag value`
        let (option, value) = match flag.split_once('=') {
            Some((option, value)) => (option.to_string(), value.to_string()),
            None => {
                let value = iter
                    .next()
                    .with_context(|| format!("output option '{arg}' requires an argument"))?;
                (flag.to_string(), value.clone())
            }
        };
        options.push((option, value));
    }

    Ok(output_request(name, &options)?)
}

/// Send a request and return the daemon's reply
fn send(request: &Request) -> Result<String> {
    let path = socket_path();
    let mut stream = UnixStream::connect(&path)
        .with_context(|| format!("Unable to connect to oguri socket at {:?}", path))?;

    stream
        .write_all(&request.encode())
        .context("Unable to send command to oguri")?;
    stream
        .shutdown(Shutdown::Write)
        .context("Unable to finish sending command to oguri")?;

    let mut reply = String::new();
    stream
        .read_to_string(&mut reply)
        .context("Unable to read response from oguri")?;
    Ok(reply)
}

fn run(args: &[String]) -> Result<ExitCode> {
    let Some((command, rest)) = args.split_first() else {
        eprint!("{USAGE}");
        return Ok(ExitCode::FAILURE);
    };

    let request = match command.as_str() {
        "-h" | "--help" => {
            print!("{USAGE}");
            return Ok(ExitCode::SUCCESS);
        }
        "-V" | "--version" => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            return Ok(ExitCode::SUCCESS);
        }
        "output" => parse_output(rest)?,
        "reload" => Request::Reload,
        other => bail!("Unknown command '{other}'"),
    };

    let reply = send(&request)?;
    if reply.is_empty() {
        Ok(ExitCode::SUCCESS)
    } else {
        eprint!("{reply}");
        Ok(ExitCode::FAILURE)
    }
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match run(&args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("ogurictl: {:#}\n\n{USAGE}", e);
            ExitCode::FAILURE
        }
    }
}
