//! Smoke client: connects, sends a few echo commands and closes.
//!
//! Usage: `test-client [addr] [class-code]` (default `127.0.0.1:1523`, class 1).

use conn_server::transport::Reply;
use conn_server::{open_client, ClientClass};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| "127.0.0.1:1523".to_string());
    let class = args
        .next()
        .and_then(|code| code.parse().ok())
        .and_then(ClientClass::from_code)
        .unwrap_or(ClientClass::Normal);

    let mut client = open_client(&addr, class).await?;
    println!("connected to {} as {} (client id {})", addr, class, client.client_id());

    for (code, payload) in [(1u16, &b"ping"[..]), (2, &b""[..]), (3, &[0xabu8; 4096][..])] {
        match client.request(code, payload).await? {
            Reply::Data(bytes) => println!("fn {}: {} bytes back", code, bytes.len()),
            Reply::Error { code: err, .. } => println!("fn {}: error {}", code, err),
            Reply::Aborted => println!("fn {}: aborted", code),
        }
    }

    client.close().await?;
    println!("closed");
    Ok(())
}
