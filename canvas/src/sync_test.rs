use frames::{CursorMoved, Presence, Welcome};
use tokio::time::timeout;

use super::*;
use crate::grid::Grid;
use crate::ledger::MemoryLedger;
use crate::store::{CellStore, Owner};

const RED: Rgb = Rgb::new(0xFF_00_00);
const GREEN: Rgb = Rgb::new(0x00_FF_00);

fn engine_with(ledger: MemoryLedger, config: SyncConfig) -> (Arc<MemoryLedger>, Arc<SyncEngine>) {
    let ledger = Arc::new(ledger);
    let store = SharedCellStore::new(CellStore::new(Grid::new(100)));
    let engine = Arc::new(SyncEngine::new(ledger.clone(), store, None, config));
    (ledger, engine)
}

fn engine() -> (Arc<MemoryLedger>, Arc<SyncEngine>) {
    engine_with(MemoryLedger::new(Grid::new(100), "0xme"), SyncConfig::default())
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    timeout(Duration::from_secs(120), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn paint_msg(x: u32, y: u32, owner: &str) -> Message {
    Message::PixelPainted(PixelPainted { x, y, color: GREEN, owner: owner.into(), timestamp: 1, tx_hash: None })
}

// =============================================================================
// Single-cell paint
// =============================================================================

#[tokio::test(start_paused = true)]
async fn paint_shows_pending_then_confirmed() {
    let ledger = MemoryLedger::new(Grid::new(100), "0xme").with_confirm_delay(Duration::from_secs(2));
    let (_ledger, engine) = engine_with(ledger, SyncConfig::default());
    let _loop = engine.spawn(None);

    let handle = engine.paint(3, 4, RED).await.expect("paint").expect("submitted");
    assert_eq!(handle.cells, 1);
    assert!(engine.get_cell(3, 4).expect("cell").is_pending());

    wait_until(|| engine.get_cell(3, 4).is_some_and(|c| c.version == 1)).await;
    let cell = engine.get_cell(3, 4).expect("cell");
    assert_eq!(cell.owner, Owner::Account("0xme".into()));
    assert_eq!(cell.color, RED);
}

#[tokio::test(start_paused = true)]
async fn paint_is_skipped_while_pending() {
    let ledger = MemoryLedger::new(Grid::new(100), "0xme").with_confirm_delay(Duration::from_secs(5));
    ledger.set_price(1);
    ledger.set_balance(10);
    let (ledger, engine) = engine_with(ledger, SyncConfig::default());

    assert!(engine.paint(1, 1, RED).await.expect("paint").is_some());
    assert!(engine.paint(1, 1, GREEN).await.expect("paint").is_none());
    assert_eq!(ledger.balance(), 9);
    assert_eq!(engine.get_cell(1, 1).expect("cell").color, RED);
}

#[tokio::test]
async fn paint_off_grid_is_rejected() {
    let (_ledger, engine) = engine();
    let err = engine.paint(100, 0, RED).await.expect_err("should fail");
    assert!(matches!(err, SyncError::OutOfBounds { x: 100, y: 0 }));
}

#[tokio::test(start_paused = true)]
async fn unconfirmed_pending_expires_after_timeout() {
    let ledger = MemoryLedger::new(Grid::new(100), "0xme").with_confirm_delay(Duration::from_secs(60));
    let (_ledger, engine) = engine_with(ledger, SyncConfig::default());
    let _loop = engine.spawn(None);

    engine.paint(7, 7, RED).await.expect("paint");
    tokio::time::sleep(Duration::from_secs(29)).await;
    assert!(engine.get_cell(7, 7).is_some_and(|c| c.is_pending()));

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(engine.get_cell(7, 7).is_none());

    // The late confirmation still lands.
    wait_until(|| engine.get_cell(7, 7).is_some_and(|c| c.is_confirmed())).await;
}

#[tokio::test(start_paused = true)]
async fn confirmation_before_timeout_survives_expiry_timer() {
    let (_ledger, engine) = engine();
    let _loop = engine.spawn(None);

    engine.paint(2, 2, RED).await.expect("paint");
    wait_until(|| engine.get_cell(2, 2).is_some_and(|c| c.version == 1)).await;
    tokio::time::sleep(PENDING_TIMEOUT + Duration::from_secs(1)).await;
    assert_eq!(engine.get_cell(2, 2).expect("cell").version, 1);
}

// =============================================================================
// Batch submission
// =============================================================================

#[tokio::test(start_paused = true)]
async fn submit_selection_writes_every_cell_and_clears_selection() {
    let (ledger, engine) = engine();
    let _loop = engine.spawn(None);

    engine.begin_selection(Shape::Rectangle, 2, 2);
    engine.extend_selection(4, 4);
    assert!(engine.commit_selection());

    let handle = engine.submit_selection(GREEN).await.expect("submit");
    assert_eq!(handle.cells, 9);
    assert!(engine.selection_pixels().is_empty());

    wait_until(|| (2..=4).all(|x| (2..=4).all(|y| engine.get_cell(x, y).is_some_and(|c| c.version == 1)))).await;
    assert_eq!(engine.regions().refresh_set().len(), 1 + 1);
    assert_eq!(ledger.reads(), 0);
}

#[tokio::test]
async fn failed_submission_rolls_back_and_keeps_selection() {
    let ledger = MemoryLedger::new(Grid::new(100), "0xme");
    ledger.set_price(10);
    ledger.set_balance(50);
    let (_ledger, engine) = engine_with(ledger, SyncConfig::default());
    let mut changes = engine.subscribe_changes();

    engine.begin_selection(Shape::Line, 0, 0);
    engine.extend_selection(9, 0);
    engine.commit_selection();

    let err = engine.submit_selection(RED).await.expect_err("should fail");
    assert_eq!(err.error_code(), "E_INSUFFICIENT_FUNDS");
    assert!(!err.retryable());
    assert!((0..10).all(|x| engine.get_cell(x, 0).is_none()));
    assert_eq!(engine.selection_pixels().len(), 10);

    let mut published = 0;
    while changes.try_recv().is_ok() {
        published += 1;
    }
    assert_eq!(published, 20, "ten pending placements and ten rollbacks");
}

/// Ledger whose writes wait until the test releases them.
struct GatedLedger {
    inner: MemoryLedger,
    entered: tokio::sync::Notify,
    release: tokio::sync::Notify,
}

#[async_trait::async_trait]
impl Ledger for GatedLedger {
    async fn submit_write(&self, writes: &[PixelWrite]) -> Result<WriteHandle, LedgerError> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.submit_write(writes).await
    }

    async fn read_region(&self, region: crate::region::RegionKey) -> Result<Vec<Cell>, LedgerError> {
        self.inner.read_region(region).await
    }

    async fn unit_price(&self) -> Result<u128, LedgerError> {
        self.inner.unit_price().await
    }

    fn subscribe_confirmed(&self) -> broadcast::Receiver<Cell> {
        self.inner.subscribe_confirmed()
    }
}

#[tokio::test]
async fn selection_made_during_submit_survives_success() {
    let ledger = Arc::new(GatedLedger {
        inner: MemoryLedger::new(Grid::new(100), "0xme"),
        entered: tokio::sync::Notify::new(),
        release: tokio::sync::Notify::new(),
    });
    let store = SharedCellStore::new(CellStore::new(Grid::new(100)));
    let engine = Arc::new(SyncEngine::new(ledger.clone(), store, None, SyncConfig::default()));

    engine.begin_selection(Shape::Rectangle, 0, 0);
    engine.extend_selection(1, 1);
    engine.commit_selection();

    let submit = tokio::spawn({
        let engine = engine.clone();
        async move { engine.submit_selection(RED).await }
    });
    ledger.entered.notified().await;

    engine.begin_selection(Shape::Line, 5, 5);
    engine.extend_selection(7, 5);
    assert!(engine.commit_selection());
    ledger.release.notify_one();

    let handle = submit.await.expect("join").expect("submit");
    assert_eq!(handle.cells, 4);
    assert!(engine.selection().is_committed());
    assert_eq!(engine.selection_pixels(), vec![Coord::new(5, 5), Coord::new(6, 5), Coord::new(7, 5)]);
}

#[tokio::test]
async fn submit_requires_committed_selection() {
    let (_ledger, engine) = engine();
    assert!(matches!(engine.submit_selection(RED).await, Err(SyncError::NothingCommitted)));

    engine.begin_selection(Shape::Rectangle, 1, 1);
    assert!(matches!(engine.submit_selection(RED).await, Err(SyncError::NothingCommitted)));

    engine.begin_selection(Shape::Rectangle, -10, -10);
    engine.extend_selection(-5, -5);
    engine.commit_selection();
    assert!(matches!(engine.submit_selection(RED).await, Err(SyncError::EmptySelection)));
}

#[tokio::test]
async fn selection_cost_uses_current_price() {
    let (ledger, engine) = engine();
    engine.begin_selection(Shape::Rectangle, 0, 0);
    engine.extend_selection(2, 1);
    ledger.set_price(5);
    assert_eq!(engine.selection_cost().await.expect("cost"), Some(30));
    ledger.set_price(7);
    assert_eq!(engine.selection_cost().await.expect("cost"), Some(42));

    ledger.set_fail_reads(true);
    assert!(engine.selection_cost().await.is_err());
}

// =============================================================================
// Relay events
// =============================================================================

#[tokio::test]
async fn relayed_paint_shows_as_unconfirmed_hint() {
    let (_ledger, engine) = engine();
    engine.handle_relay(paint_msg(5, 5, "0xbob"));
    let cell = engine.get_cell(5, 5).expect("cell");
    assert_eq!(cell.version, 0);
    assert_eq!(cell.owner, Owner::Account("0xbob".into()));

    engine.handle_confirmed(Cell::confirmed(Coord::new(5, 5), RED, "0xbob", 1, 10));
    assert_eq!(engine.get_cell(5, 5).expect("cell").color, RED);

    engine.handle_relay(paint_msg(5, 5, "0xcarol"));
    assert_eq!(engine.get_cell(5, 5).expect("cell").version, 1);
}

#[tokio::test(start_paused = true)]
async fn peer_hint_keeps_local_pending_write_and_its_guard() {
    let ledger = MemoryLedger::new(Grid::new(100), "0xme").with_confirm_delay(Duration::from_secs(5));
    let (_ledger, engine) = engine_with(ledger, SyncConfig::default());

    assert!(engine.paint(6, 6, RED).await.expect("paint").is_some());
    engine.handle_relay(paint_msg(6, 6, "0xbob"));

    let shown = engine.get_cell(6, 6).expect("cell");
    assert!(shown.is_pending());
    assert_eq!(shown.color, RED);
    assert!(engine.paint(6, 6, GREEN).await.expect("paint").is_none());
}

#[tokio::test]
async fn welcome_records_session_and_replays_paints() {
    let (_ledger, engine) = engine();
    let recent = vec![
        PixelPainted { x: 1, y: 1, color: RED, owner: "0xa".into(), timestamp: 1, tx_hash: None },
        PixelPainted { x: 2, y: 2, color: RED, owner: "0xb".into(), timestamp: 2, tx_hash: None },
    ];
    engine.handle_relay(Message::Welcome(Welcome { session_id: "me".into(), active_sessions: 3, recent_paints: recent }));
    assert_eq!(engine.session_id().as_deref(), Some("me"));
    assert!(engine.get_cell(1, 1).is_some());
    assert!(engine.get_cell(2, 2).is_some());
}

#[tokio::test]
async fn cursors_follow_relay_presence() {
    let (_ledger, engine) = engine();
    engine.handle_relay(Message::Welcome(Welcome { session_id: "me".into(), active_sessions: 1, recent_paints: vec![] }));
    let cursor = |id: &str| {
        Message::CursorMoved(CursorMoved { session_id: id.into(), x: 10, y: 20, color: GREEN, timestamp: 1 })
    };

    engine.handle_relay(cursor("peer"));
    engine.handle_relay(cursor("me"));
    let active = engine.active_cursors();
    assert_eq!(active.len(), 1);
    assert_eq!((active[0].id.as_str(), active[0].x, active[0].y), ("peer", 10, 20));

    engine.handle_relay(Message::UserLeft(Presence { session_id: "peer".into(), timestamp: 2 }));
    assert!(engine.active_cursors().is_empty());
}

#[tokio::test]
async fn canvas_stats_are_kept_for_the_ui() {
    let (_ledger, engine) = engine();
    assert!(engine.latest_stats().is_none());
    let stats = CanvasStats {
        active_sessions: 2,
        total_paints: 10,
        paints_per_second: 0.17,
        unique_artists: 2,
        recent_paints: 10,
        hourly_paints: 10,
        timestamp: 5,
    };
    engine.handle_relay(Message::CanvasStats(stats.clone()));
    assert_eq!(engine.latest_stats(), Some(stats));
}

#[tokio::test]
async fn sweep_drops_stale_cursors_and_hints() {
    let (_ledger, engine) = engine();
    engine.handle_relay(paint_msg(9, 9, "0xbob"));
    engine.handle_relay(Message::CursorMoved(CursorMoved {
        session_id: "peer".into(),
        x: 1,
        y: 1,
        color: RED,
        timestamp: 1,
    }));

    engine.sweep_at(Instant::now() + RELAYED_HINT_TTL);
    assert!(engine.get_cell(9, 9).is_none());
    assert!(engine.store().lock().active_cursors_at(Instant::now()).is_empty());
}

#[tokio::test]
async fn no_relay_means_disconnected_and_cursor_pings_fail_softly() {
    let (_ledger, engine) = engine();
    assert_eq!(engine.relay_status(), ConnectionStatus::Disconnected);
    assert!(matches!(engine.move_cursor(1, 1, RED), Err(RelayError::NotConnected)));
}

// =============================================================================
// Regions
// =============================================================================

#[tokio::test]
async fn refresh_loads_confirmed_cells_into_store() {
    let (ledger, engine) = engine();
    ledger.seed(Coord::new(42, 17), RED, "0xa");
    let report = engine.refresh().await;
    assert_eq!(report.failed, 0);
    assert_eq!(report.loaded, 1);
    assert_eq!(engine.get_cell(42, 17).expect("cell").version, 1);
}

#[test]
fn sync_error_codes() {
    assert_eq!(SyncError::NothingCommitted.error_code(), "E_NOTHING_COMMITTED");
    assert_eq!(SyncError::EmptySelection.error_code(), "E_EMPTY_SELECTION");
    let ledger = SyncError::from(LedgerError::Unavailable("down".into()));
    assert_eq!(ledger.error_code(), "E_LEDGER_UNAVAILABLE");
    assert!(ledger.retryable());
}
