use anyhow::{Context, Result};
use chrono::Local;
use csv::Writer;
use serde::Serialize;
use std::fs::{create_dir_all, OpenOptions};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::model::Order;

#[derive(Debug, Serialize, Clone)]
pub struct OrderRecord {
    pub timestamp: String,
    pub symbol: String,
    pub event: String, // REQ, ACK, FILL, CANCEL
    pub side: String,
    pub price: f64,
    pub volume: f64,
    pub userref: i64,
    pub client_id: String,
    pub exchange_id: Option<String>,
}

/// Append-only CSV trail of every order request and outcome.
#[derive(Clone)]
pub struct OrderAuditLogger {
    symbol: String,
    writer: Arc<Mutex<Writer<std::fs::File>>>,
}

impl OrderAuditLogger {
    pub fn new(log_dir: &str, symbol: &str) -> Result<Self> {
        let dir = Path::new(log_dir);
        create_dir_all(dir).context("Failed to create log directory")?;

        let file_path = dir.join("orders.csv");
        let file_exists = file_path.exists();

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file_path)
            .context("Failed to open orders.csv")?;

        let writer = csv::WriterBuilder::new()
            .has_headers(!file_exists)
            .from_writer(file);

        Ok(Self {
            symbol: symbol.to_string(),
            writer: Arc::new(Mutex::new(writer)),
        })
    }

    fn log(&self, event: &str, order: &Order) {
        let record = OrderRecord {
            timestamp: Local::now().to_rfc3339(),
            symbol: self.symbol.clone(),
            event: event.to_string(),
            side: order.side.to_string(),
            price: order.price,
            volume: order.volume,
            userref: order.userref,
            client_id: order.client_id.to_string(),
            exchange_id: order.exchange_id.clone(),
        };
        if let Ok(mut w) = self.writer.lock() {
            if let Err(e) = w.serialize(record) {
                eprintln!("Failed to write order audit log: {}", e);
            } else {
                let _ = w.flush();
            }
        }
    }

    pub fn log_request(&self, order: &Order) {
        self.log("REQ", order);
    }

    pub fn log_ack(&self, order: &Order) {
        self.log("ACK", order);
    }

    pub fn log_fill(&self, order: &Order) {
        self.log("FILL", order);
    }

    pub fn log_cancel(&self, order: &Order) {
        self.log("CANCEL", order);
    }
}
