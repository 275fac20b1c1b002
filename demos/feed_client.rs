use feed_flow::client::Received;
use feed_flow::handshake::connect_async_with_config;
use feed_flow::options::ClientOptions;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const FALLBACK_URL: &str = "wss://stream.binance.com:9443/ws/btcusdt@trade";

/// Subscribes to a public market data feed and prints whatever arrives.
/// Pass the WebSocket URL as the only argument, or set FEED_FLOW_URL;
/// Ctrl-C cancels the pending receive and closes the connection.
#[tokio::main]
async fn main() {
    env_logger::init();

    let url = std::env::args().nth(1).unwrap_or_else(|| {
        std::env::var("FEED_FLOW_URL").unwrap_or_else(|_| FALLBACK_URL.to_string())
    });

    let mut options = ClientOptions::default();
    options.compression = true;
    options.ping_interval = Some(Duration::from_secs(30));

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_cancel.cancel();
        }
    });

    let client = match connect_async_with_config(&url, options, cancel).await {
        Ok(client) => client,
        Err(err) => {
            eprintln!("Error when performing handshake: {}", err);
            return;
        }
    };
    println!("connected to {}", url);

    loop {
        match client.receive().await {
            Ok(Received::Message(message)) => match message.as_text() {
                Ok(text) => println!("{}", text),
                Err(_) => println!("<{} binary bytes>", message.payload().len()),
            },
            Ok(Received::Close(frame)) => {
                println!("server closed: code {:?} reason {:?}", frame.code, frame.reason);
                break;
            }
            Err(err) => {
                eprintln!("Received error from the stream: {}", err);
                break;
            }
        }
    }

    client.close().await;
}
