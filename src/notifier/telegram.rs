use anyhow::Result;
use std::env;
use std::sync::Arc;
use teloxide::prelude::*;
use tokio::sync::{broadcast, Mutex};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};

use super::{BotSummary, NotifierEvent, Severity};

pub struct TelegramReporter {
    bot: Bot,
    chat_id: ChatId,
    receiver: broadcast::Receiver<NotifierEvent>,
}

impl TelegramReporter {
    /// Builds the reporter from TELEGRAM_BOT_TOKEN / TELEGRAM_CHAT_ID.
    /// Returns `None` when Telegram is not configured.
    pub fn new(receiver: broadcast::Receiver<NotifierEvent>) -> Result<Option<Self>> {
        let token = env::var("TELEGRAM_BOT_TOKEN").ok();
        let chat_id_str = env::var("TELEGRAM_CHAT_ID").ok();

        if let (Some(token), Some(chat_id_val)) = (token, chat_id_str) {
            let bot = Bot::new(token);
            let chat_id = ChatId(chat_id_val.parse::<i64>()?);
            Ok(Some(Self {
                bot,
                chat_id,
                receiver,
            }))
        } else {
            Ok(None)
        }
    }

    pub async fn run(self) {
        info!("Telegram Reporter started.");
        let bot = self.bot.clone();
        let chat_id = self.chat_id;

        // Shared state for the command handler to answer /status from.
        let last_summary: Arc<Mutex<Option<BotSummary>>> = Arc::new(Mutex::new(None));
        let last_summary_evt = last_summary.clone();

        // Spawn command handler (REPL).
        let bot_repl = bot.clone();
        tokio::spawn(async move {
            let handler = Update::filter_message().endpoint(move |bot: Bot, msg: Message| {
                let summary_lock = last_summary.clone();
                async move {
                    if let Some(text) = msg.text() {
                        if text == "/status" {
                            let summary = summary_lock.lock().await;
                            if let Some(s) = &*summary {
                                bot.send_message(msg.chat.id, format_summary(s))
                                    .parse_mode(teloxide::types::ParseMode::Html)
                                    .await?;
                            } else {
                                bot.send_message(msg.chat.id, "⚠️ No status available yet.")
                                    .await?;
                            }
                        }
                    }
                    respond(())
                }
            });

            Dispatcher::builder(bot_repl, handler)
                .enable_ctrlc_handler()
                .build()
                .dispatch()
                .await;
        });

        // Event loop (notifications).
        let mut stream = BroadcastStream::new(self.receiver);
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(NotifierEvent::Summary(summary)) => {
                    let mut lock = last_summary_evt.lock().await;
                    *lock = Some(summary);
                }
                Ok(NotifierEvent::StateChange(event)) => {
                    let text = format!("{} {}", event.severity.icon(), event.message);
                    if let Err(e) = bot
                        .send_message(chat_id, text)
                        .parse_mode(teloxide::types::ParseMode::Html)
                        .await
                    {
                        // Delivery failures never affect the trading core.
                        error!("Failed to send Telegram notification: {}", e);
                    }
                }
                Err(e) => {
                    warn!("Telegram broadcast stream lagged: {}", e);
                }
            }
        }
    }
}

fn format_summary(s: &BotSummary) -> String {
    format!(
        "👑 <b>{}</b>\n\
         Symbol: <code>{}</code>\n\
         📉 Price: <code>{:.4}</code>\n\
         💰 Investment: <code>{:.2}</code> / <code>{:.2}</code>\n\
         💠 Amount per grid: <code>{:.2}</code>\n\
         📦 Orders: <code>{}</code> buys, <code>{}</code> sells\n\
         🧮 Surplus: <code>{:.8}</code>",
        s.name,
        s.symbol,
        s.last_price,
        s.investment,
        s.max_investment,
        s.amount_per_grid,
        s.open_buys,
        s.open_sells,
        s.surplus_volume,
    )
}
