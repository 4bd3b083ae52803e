//! WebSocket echo server demo
//!
//! Echoes every text or binary message back to its sender.

use sockwave::{Config, Frame, WsServer};

fn main() -> sockwave::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    let addr = args
        .get(1)
        .map(|s| s.as_str())
        .unwrap_or("127.0.0.1:9001")
        .parse()
        .expect("listen address");

    let mut server = WsServer::bind(addr, Config::default())?;

    println!("Sockwave echo server");
    println!("====================");
    println!("Listening on: {}", server.local_addr().expect("bound address"));

    server.set_open_callback(|core, conn_id| {
        match core.peer_addr(conn_id) {
            Ok(peer) => println!("[{conn_id}] open ({peer})"),
            Err(_) => println!("[{conn_id}] open"),
        }
    });

    server.set_message_callback(|core, conn_id, message| {
        let frame = if message.is_text() {
            Frame::text(message.into_bytes())
        } else {
            Frame::binary(message.into_bytes())
        };
        core.queue_frame(conn_id, frame);
    });

    server.set_close_callback(|_, conn_id| {
        println!("[{conn_id}] closed");
    });

    let status = server.run()?;
    std::process::exit(status)
}
