//! tdlayer-bot — Showcase bot built with tdlayer-client.
//!
//! There is no native library here: a [`MemoryTransport`] plays its part,
//! answering requests and feeding a short script of incoming messages.
//!
//! `cargo run -p tdlayer-bot`

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use tdlayer_client::{
    ANY_UPDATE, Client, Config, Filter, Handler, HandlerEntry, HandlerError, MemoryTransport,
    Request, Update,
};

const BOT_CHAT: i64 = 777;

#[tokio::main]
async fn main() {
    if std::env::var("RUST_LOG").is_err() {
        unsafe { std::env::set_var("RUST_LOG", "tdlayer_client=info,tdlayer_bot=info"); }
    }
    env_logger::init();
    if let Err(e) = run().await {
        eprintln!("✗ {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let transport = Arc::new(fake_native_side());
    let client = Client::new(transport.clone(), Config {
        poll_timeout:            Duration::from_millis(100),
        default_handler_timeout: Some(Duration::from_secs(5)),
        ..Default::default()
    })?;

    register_handlers(&client)?;
    client.start();

    let me = client.invoke(Request::new("getMe")).await?;
    if me.is_error() {
        return Err(format!("getMe failed: {:?}", me.error()).into());
    }
    println!("✅ Logged in as @{}", me.get("username").and_then(Value::as_str).unwrap_or("bot"));

    if let Some(resp) = client.execute(&Request::new("getOption").with("name", "version"))? {
        println!("ℹ️  native version: {}", resp.get("value").unwrap_or(&Value::Null));
    }

    println!("👂 Replaying a few incoming messages…\n");
    for text in ["/start", "/ping", "/echo hello there", "just chatting", "/slow"] {
        transport.push(incoming(BOT_CHAT, text));
    }

    // Give handlers time to run (the /slow one is cut off by its timeout).
    tokio::time::sleep(Duration::from_millis(1500)).await;

    client.stop().await;
    println!("\n👋 Stopped ({:?}), {} request(s) left pending", client.state(), client.pending_requests());
    for sent in transport.sent() {
        if sent["@type"] == "sendMessage" {
            println!("   → {}", sent.pointer("/input_message_content/text/text").unwrap_or(&Value::Null));
        }
    }
    Ok(())
}

// ─── Handlers ────────────────────────────────────────────────────────────────

fn register_handlers(client: &Client) -> Result<(), Box<dyn std::error::Error>> {
    let commands = Filter::incoming() & Filter::text_prefix("/");

    client.add_handler(
        HandlerEntry::new(ANY_UPDATE, Handler::named("log", |_, update: Update| async move {
            log::debug!("update {}", update.type_name());
            Ok(())
        }))
        .position(0),
    )?;

    client.add_handler(
        HandlerEntry::new("updateNewMessage", Handler::named("start", |client, update| async move {
            reply(&client, &update, "👋 Hi! Try /ping or /echo <text>.").await
        }))
        .filter(commands.clone() & Filter::text_prefix("/start")),
    )?;

    client.add_handler(
        HandlerEntry::new("updateNewMessage", Handler::named("ping", |client, update| async move {
            let now = Utc::now().format("%H:%M:%S%.3f");
            reply(&client, &update, &format!("🏓 Pong! ({now} UTC)")).await
        }))
        .filter(commands.clone() & Filter::text_prefix("/ping")),
    )?;

    client.add_handler(
        HandlerEntry::new("updateNewMessage", Handler::named("echo", |client, update| async move {
            let text = update.message_text().unwrap_or("");
            let arg  = text.strip_prefix("/echo").unwrap_or("").trim();
            let out  = if arg.is_empty() { "Usage: /echo <text>".to_string() } else { arg.to_string() };
            reply(&client, &update, &out).await
        }))
        .filter(commands.clone() & Filter::text_prefix("/echo")),
    )?;

    client.add_handler(
        HandlerEntry::new("updateNewMessage", Handler::named("slow", |_, _| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }))
        .filter(commands & Filter::text_prefix("/slow"))
        .timeout(Duration::from_millis(300)),
    )?;

    Ok(())
}

async fn reply(client: &Client, update: &Update, text: &str) -> Result<(), HandlerError> {
    let chat_id = update.chat_id().ok_or("update has no chat")?;
    let req = Request::new("sendMessage")
        .with("chat_id", chat_id)
        .with("input_message_content", json!({
            "@type": "inputMessageText",
            "text":  {"@type": "formattedText", "text": text},
        }));
    let resp = client.invoke(req).await?;
    if let Some(e) = resp.error() {
        log::warn!("sendMessage failed: {e}");
    }
    Ok(())
}

// ─── Fake native side ────────────────────────────────────────────────────────

fn fake_native_side() -> MemoryTransport {
    let next_message_id = AtomicI64::new(1);
    MemoryTransport::new().with_responder(move |req| {
        match req["@type"].as_str()? {
            "getMe" => Some(json!({"@type": "user", "id": 1, "username": "tdlayer_bot"})),
            "getOption" => Some(json!({"@type": "optionValueString", "value": "1.8.0"})),
            "sendMessage" => Some(json!({
                "@type":   "message",
                "id":      next_message_id.fetch_add(1, Ordering::Relaxed),
                "chat_id": req["chat_id"].clone(),
                "content": req["input_message_content"].clone(),
            })),
            other => Some(json!({"@type": "error", "code": 400, "message": format!("{other} not supported")})),
        }
    })
}

fn incoming(chat_id: i64, text: &str) -> Value {
    json!({
        "@type": "updateNewMessage",
        "message": {
            "@type":       "message",
            "chat_id":     chat_id,
            "is_outgoing": false,
            "content":     {"@type": "messageText", "text": {"@type": "formattedText", "text": text}},
        },
    })
}
