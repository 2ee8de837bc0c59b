//! pairlink-ctl — command-line interface for the pairlink relay.

use anyhow::Result;

mod cmd;

use cmd::http::Client;

fn usage() -> ! {
    eprintln!(
        "usage: pairlink-ctl [--url <base>] [--admin-key <key>] <command>

commands:
  health                 relay health and counters
  pair new               mint a pairing token (admin)
  pair status <token>    slot occupancy for a token
  pair revoke <token>    revoke a token and evict its session (admin)
  register               mint a token via the public endpoint
  tokens                 list all tokens (admin)

The admin key can also come from $PAIRLINK_ADMIN_KEY."
    );
    std::process::exit(2);
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut url = "http://127.0.0.1:8443".to_string();
    let mut admin_key = std::env::var("PAIRLINK_ADMIN_KEY").ok();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    while args.first().map(|a| a.starts_with("--")).unwrap_or(false) {
        let flag = args.remove(0);
        if args.is_empty() {
            usage();
        }
        let value = args.remove(0);
        match flag.as_str() {
            "--url" => url = value,
            "--admin-key" => admin_key = Some(value),
            _ => usage(),
        }
    }

    let client = Client::new(url, admin_key);

    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["health"] => cmd::health::run(&client).await,
        ["pair", "new"] => cmd::pair::new_token(&client).await,
        ["pair", "status", token] => cmd::pair::status(&client, token).await,
        ["pair", "revoke", token] => cmd::pair::revoke(&client, token).await,
        ["register"] => cmd::pair::register(&client).await,
        ["tokens"] => cmd::tokens::run(&client).await,
        _ => usage(),
    }
}
