// State Manager for the engine
// SQLite-based persistence with JSON backup
//
// One document per symbol holding positions, grid, trade log, performance and
// the orders still resting on the venue. Every save replaces the whole
// document.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::grid::GridState;
use crate::lifecycle::{PositionBook, Transition};
use crate::reconciler::LiveOrder;
use crate::{PerformanceAggregate, Symbol, TradeRecord};

// =============================================================================
// Data Models
// =============================================================================

/// Disk form of one symbol's state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolSnapshot {
    pub symbol: Symbol,
    #[serde(default)]
    pub book: PositionBook,
    #[serde(default)]
    pub grid: Option<GridState>,
    #[serde(default)]
    pub trades: Vec<TradeRecord>,
    #[serde(default)]
    pub performance: PerformanceAggregate,
    #[serde(default)]
    pub live_orders: Vec<LiveOrder>,
    /// Position transition whose market order is still unconfirmed
    #[serde(default)]
    pub pending_transition: Option<Transition>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl SymbolSnapshot {
    /// Flat state for a symbol with no stored record
    pub fn empty(symbol: Symbol) -> Self {
        Self {
            symbol,
            book: PositionBook::default(),
            grid: None,
            trades: Vec::new(),
            performance: PerformanceAggregate::default(),
            live_orders: Vec::new(),
            pending_transition: None,
            updated_at: None,
        }
    }
}

// =============================================================================
// State Manager Implementation
// =============================================================================

pub struct SqliteStateManager {
    conn: Arc<Mutex<Connection>>,
    json_backup_path: PathBuf,
    auto_backup: bool,
}

impl SqliteStateManager {
    pub fn new<P: AsRef<Path>>(db_path: P, json_backup_path: P, auto_backup: bool) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Some(parent) = json_backup_path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

        conn.pragma_update(None, "journal_mode", "WAL")?;

        let manager = Self {
            conn: Arc::new(Mutex::new(conn)),
            json_backup_path: json_backup_path.as_ref().to_path_buf(),
            auto_backup,
        };

        manager.create_tables()?;
        info!("SQLite state manager initialized at {}", db_path.display());

        Ok(manager)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("state database mutex poisoned"))
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS symbol_state (
                symbol TEXT PRIMARY KEY,
                document TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        debug!("Database schema created/verified");
        Ok(())
    }

    /// Replace the stored document for `snapshot.symbol`.
    ///
    /// The JSON backup is best effort; a failed export is logged and the
    /// save still succeeds once the row is written.
    pub fn save_symbol(&self, snapshot: &SymbolSnapshot) -> Result<()> {
        let now = Utc::now();
        let mut stamped = snapshot.clone();
        stamped.updated_at = Some(now);
        let document = serde_json::to_string(&stamped)?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO symbol_state (symbol, document, updated_at)
             VALUES (?1, ?2, ?3)",
            params![snapshot.symbol.as_str(), document, now.to_rfc3339()],
        )
        .with_context(|| format!("Failed to save state for {}", snapshot.symbol))?;

        debug!(
            "State saved: {} [{}] trades={} live_orders={}",
            snapshot.symbol,
            snapshot.book.state(),
            snapshot.trades.len(),
            snapshot.live_orders.len()
        );

        if self.auto_backup {
            drop(conn);
            if let Err(e) = self.export_json() {
                warn!("JSON backup failed after saving {}: {:#}", snapshot.symbol, e);
            }
        }

        Ok(())
    }

    pub fn load_symbol(&self, symbol: &Symbol) -> Result<Option<SymbolSnapshot>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT document FROM symbol_state WHERE symbol = ?1")?;

        let document = stmt.query_row(params![symbol.as_str()], |row| row.get::<_, String>(0));

        match document {
            Ok(doc) => {
                let snapshot: SymbolSnapshot = serde_json::from_str(&doc)
                    .with_context(|| format!("Corrupt state document for {}", symbol))?;
                Ok(Some(snapshot))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                debug!("No stored state for {}", symbol);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Stored document, or the flat default when there is none
    pub fn load_or_default(&self, symbol: &Symbol) -> Result<SymbolSnapshot> {
        Ok(self
            .load_symbol(symbol)?
            .unwrap_or_else(|| SymbolSnapshot::empty(symbol.clone())))
    }

    pub fn load_all(&self) -> Result<Vec<SymbolSnapshot>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT symbol, document FROM symbol_state ORDER BY symbol")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let snapshots = rows
            .into_iter()
            .map(|(symbol, doc)| {
                serde_json::from_str::<SymbolSnapshot>(&doc)
                    .with_context(|| format!("Corrupt state document for {}", symbol))
            })
            .collect::<Result<Vec<_>>>()?;

        debug!("Loaded {} symbol documents", snapshots.len());
        Ok(snapshots)
    }

    pub fn export_json(&self) -> Result<()> {
        let snapshots = self.load_all()?;

        let state = serde_json::json!({
            "exported_at": Utc::now().to_rfc3339(),
            "symbols": snapshots,
        });

        std::fs::write(&self.json_backup_path, serde_json::to_string_pretty(&state)?)
            .with_context(|| format!("Failed to write {}", self.json_backup_path.display()))?;
        debug!("State exported to: {}", self.json_backup_path.display());
        Ok(())
    }

    pub fn json_backup_path(&self) -> &Path {
        &self.json_backup_path
    }
}

// =============================================================================
// Factory Function
// =============================================================================

pub fn create_state_manager<P: AsRef<Path>>(state_dir: P) -> Result<SqliteStateManager> {
    let state_dir = state_dir.as_ref();
    std::fs::create_dir_all(state_dir)
        .with_context(|| format!("Failed to create state dir {}", state_dir.display()))?;

    let db_path = state_dir.join("engine_state.db");
    let json_path = state_dir.join("engine_state.json");

    SqliteStateManager::new(db_path, json_path, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::OrderTag;
    use crate::{CloseReason, OrderSide, PositionSide};

    fn sym() -> Symbol {
        Symbol::new("ETHUSDT")
    }

    #[test]
    fn test_missing_symbol_loads_flat_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = create_state_manager(dir.path()).unwrap();
        assert!(store.load_symbol(&sym()).unwrap().is_none());
        let snapshot = store.load_or_default(&sym()).unwrap();
        assert!(snapshot.book.main.is_none());
        assert!(snapshot.trades.is_empty());
    }

    #[test]
    fn test_save_replaces_whole_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = create_state_manager(dir.path()).unwrap();
        let now = Utc::now();

        let mut snapshot = SymbolSnapshot::empty(sym());
        snapshot
            .book
            .apply(
                &sym(),
                &Transition::OpenMain {
                    side: PositionSide::Long,
                    size: 0.5,
                    take_profit_percent: 50.0,
                    below_min_lot: false,
                },
                2000.0,
                Some("o-1".into()),
                now,
            )
            .unwrap();
        snapshot.live_orders.push(LiveOrder {
            tag: OrderTag::GridBuy { generation: 1, index: 0 },
            order_id: Some("o-2".into()),
            link_id: "grid-1-0-buy-1".into(),
            side: OrderSide::Buy,
            price: Some(1980.0),
            quantity: 0.1,
            placed_at: now,
        });
        store.save_symbol(&snapshot).unwrap();

        let trade = snapshot
            .book
            .apply(
                &sym(),
                &Transition::Close {
                    slot: crate::lifecycle::Slot::Main,
                    reason: CloseReason::Manual,
                },
                2100.0,
                None,
                now,
            )
            .unwrap()
            .unwrap();
        snapshot.trades.push(trade);
        snapshot.performance = PerformanceAggregate::from_trades(&snapshot.trades);
        snapshot.live_orders.clear();
        store.save_symbol(&snapshot).unwrap();

        let loaded = store.load_symbol(&sym()).unwrap().unwrap();
        assert!(loaded.book.main.is_none());
        assert!(loaded.live_orders.is_empty());
        assert_eq!(loaded.trades.len(), 1);
        assert_eq!(loaded.performance.total_trades, 1);
        assert!(loaded.updated_at.is_some());
        assert_eq!(store.load_all().unwrap().len(), 1);
    }

    #[test]
    fn test_backup_written_on_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = create_state_manager(dir.path()).unwrap();
        store.save_symbol(&SymbolSnapshot::empty(sym())).unwrap();

        let json = std::fs::read_to_string(store.json_backup_path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["symbols"][0]["symbol"], "ETHUSDT");
    }

    #[test]
    fn test_older_document_without_optional_fields_loads() {
        let doc = r#"{"symbol":"ETHUSDT"}"#;
        let snapshot: SymbolSnapshot = serde_json::from_str(doc).unwrap();
        assert_eq!(snapshot, SymbolSnapshot::empty(sym()));
    }

    #[test]
    fn test_failed_backup_does_not_fail_save() {
        let dir = tempfile::tempdir().unwrap();
        // The backup path is a directory, so writing it fails
        let backup = dir.path().join("backup");
        std::fs::create_dir_all(&backup).unwrap();
        let store = SqliteStateManager::new(dir.path().join("state.db"), backup, true).unwrap();

        store.save_symbol(&SymbolSnapshot::empty(sym())).unwrap();
        assert!(store.load_symbol(&sym()).unwrap().is_some());
    }

    #[test]
    fn test_prices_survive_storage_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let store = create_state_manager(dir.path()).unwrap();

        let prices = [57415.518664216484, 0.1 + 0.2, 1.0 / 3.0, 2.0_f64.sqrt() * 1000.0, 1e-9 * 7.0];
        let mut snapshot = SymbolSnapshot::empty(sym());
        for (i, price) in prices.iter().enumerate() {
            snapshot.live_orders.push(LiveOrder {
                tag: OrderTag::GridBuy { generation: 0, index: i },
                order_id: Some(format!("o-{}", i)),
                link_id: format!("grid-0-{}-buy-1", i),
                side: OrderSide::Buy,
                price: Some(*price),
                quantity: price / 7.0,
                placed_at: Utc::now(),
            });
        }
        store.save_symbol(&snapshot).unwrap();

        let loaded = store.load_symbol(&sym()).unwrap().unwrap();
        for (stored, original) in loaded.live_orders.iter().zip(&snapshot.live_orders) {
            assert_eq!(stored.price.unwrap().to_bits(), original.price.unwrap().to_bits());
            assert_eq!(stored.quantity.to_bits(), original.quantity.to_bits());
        }
    }

    #[test]
    fn test_pending_transition_is_stored() {
        let dir = tempfile::tempdir().unwrap();
        let store = create_state_manager(dir.path()).unwrap();

        let mut snapshot = SymbolSnapshot::empty(sym());
        snapshot.pending_transition = Some(Transition::OpenHedge {
            side: PositionSide::Short,
            size: 0.37,
        });
        store.save_symbol(&snapshot).unwrap();

        let loaded = store.load_symbol(&sym()).unwrap().unwrap();
        assert_eq!(loaded.pending_transition, snapshot.pending_transition);
    }
}
