use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::TickerFeed;
use crate::model::PriceTick;

/// Replays a fixed price series as the ticker, one tick per `delay`.
pub struct ReplayTicker {
    prices: std::vec::IntoIter<f64>,
    seq: u64,
    delay: Duration,
}

impl ReplayTicker {
    pub fn from_prices(prices: Vec<f64>, delay: Duration) -> Self {
        Self {
            prices: prices.into_iter(),
            seq: 0,
            delay,
        }
    }

    /// Load prices from a CSV file with a `price` column (or a single
    /// unnamed column).
    pub fn from_csv(path: &Path, delay: Duration) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(path)
            .with_context(|| format!("failed to open price csv {}", path.display()))?;

        let price_idx = reader
            .headers()
            .ok()
            .and_then(|h| h.iter().position(|name| name.eq_ignore_ascii_case("price")))
            .unwrap_or(0);

        let mut prices = Vec::new();
        for record in reader.records() {
            let record = record.context("bad csv record")?;
            let field = record
                .get(price_idx)
                .with_context(|| format!("missing price column in {record:?}"))?;
            prices.push(
                field
                    .trim()
                    .parse::<f64>()
                    .with_context(|| format!("invalid price {field:?}"))?,
            );
        }
        Ok(Self::from_prices(prices, delay))
    }
}

#[async_trait]
impl TickerFeed for ReplayTicker {
    async fn next_tick(&mut self) -> Option<PriceTick> {
        let last = self.prices.next()?;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.seq += 1;
        Some(PriceTick {
            last,
            seq: self.seq,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_replay_emits_monotonic_sequence() {
        let mut feed =
            ReplayTicker::from_prices(vec![100.0, 101.0, 99.5], Duration::ZERO);
        let a = feed.next_tick().await.unwrap();
        let b = feed.next_tick().await.unwrap();
        let c = feed.next_tick().await.unwrap();
        assert_eq!((a.last, b.last, c.last), (100.0, 101.0, 99.5));
        assert!(a.seq < b.seq && b.seq < c.seq);
        assert!(feed.next_tick().await.is_none());
    }

    #[tokio::test]
    async fn test_from_csv_reads_price_column() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "time,price").unwrap();
        writeln!(file, "1,50000.0").unwrap();
        writeln!(file, "2,50100.5").unwrap();

        let mut feed = ReplayTicker::from_csv(file.path(), Duration::ZERO).unwrap();
        assert_eq!(feed.next_tick().await.unwrap().last, 50_000.0);
        assert_eq!(feed.next_tick().await.unwrap().last, 50_100.5);
        assert!(feed.next_tick().await.is_none());
    }
}
