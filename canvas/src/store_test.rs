use super::*;

const RED: Rgb = Rgb::new(0xFF_00_00);
const GREEN: Rgb = Rgb::new(0x00_FF_00);
const BLUE: Rgb = Rgb::new(0x00_00_FF);

fn at(x: u32, y: u32) -> Coord {
    Coord::new(x, y)
}

fn confirmed(x: u32, y: u32, color: Rgb, owner: &str, version: u64) -> Cell {
    Cell::confirmed(at(x, y), color, owner, version, 1_700_000_000_000 + i64::try_from(version).unwrap_or(0))
}

fn store() -> CellStore {
    CellStore::new(Grid::new(1000))
}

// =============================================================================
// Merge rule
// =============================================================================

#[test]
fn pending_then_confirmed_shows_confirmed() {
    let mut s = store();
    assert_eq!(s.upsert(Cell::pending(at(3, 4), RED)), MergeOutcome::Applied);
    assert_eq!(s.upsert(confirmed(3, 4, GREEN, "alice", 1)), MergeOutcome::Applied);

    let cell = s.get(at(3, 4)).expect("cell");
    assert_eq!(cell.color, GREEN);
    assert_eq!(cell.owner, Owner::Account("alice".into()));
    assert_eq!(cell.version, 1);
}

#[test]
fn confirmed_then_pending_upsert_keeps_confirmed() {
    let mut s = store();
    s.upsert(confirmed(3, 4, GREEN, "alice", 1));
    assert_eq!(s.upsert(Cell::pending(at(3, 4), RED)), MergeOutcome::Stale);
    assert_eq!(s.get(at(3, 4)).expect("cell").color, GREEN);
}

#[test]
fn applying_same_confirmed_cell_twice_is_idempotent() {
    let mut s = store();
    let cell = confirmed(1, 1, RED, "bob", 3);
    assert_eq!(s.upsert(cell.clone()), MergeOutcome::Applied);
    let after_first = s.get(at(1, 1)).cloned();
    assert_eq!(s.upsert(cell), MergeOutcome::Stale);
    assert_eq!(s.get(at(1, 1)).cloned(), after_first);
}

#[test]
fn lower_version_is_stale() {
    let mut s = store();
    s.upsert(confirmed(1, 1, RED, "bob", 5));
    assert_eq!(s.upsert(confirmed(1, 1, BLUE, "carol", 4)), MergeOutcome::Stale);
    assert_eq!(s.get(at(1, 1)).expect("cell").version, 5);
}

#[test]
fn displayed_version_never_decreases_under_any_order() {
    let cells = [
        Cell::pending(at(7, 7), RED),
        confirmed(7, 7, GREEN, "a", 2),
        Cell::relayed(at(7, 7), BLUE, "b"),
        confirmed(7, 7, RED, "c", 1),
        confirmed(7, 7, BLUE, "d", 3),
    ];
    let orders: [[usize; 5]; 4] = [[0, 1, 2, 3, 4], [4, 3, 2, 1, 0], [2, 0, 3, 4, 1], [1, 4, 0, 2, 3]];
    for order in orders {
        let mut s = store();
        let mut last = 0;
        for i in order {
            s.upsert(cells[i].clone());
            let version = s.get(at(7, 7)).map_or(0, |c| c.version);
            assert!(version >= last, "order {order:?} went from {last} to {version}");
            last = version;
        }
        assert_eq!(last, 3);
        assert_eq!(s.get(at(7, 7)).expect("cell").owner, Owner::Account("d".into()));
    }
}

#[test]
fn relay_hint_shows_on_blank_cell() {
    let mut s = store();
    assert_eq!(s.upsert(Cell::relayed(at(2, 2), BLUE, "bob")), MergeOutcome::Applied);
    let cell = s.get(at(2, 2)).expect("cell");
    assert_eq!(cell.version, 0);
    assert!(!cell.is_confirmed());
    assert!(!s.has_pending(at(2, 2)));
}

#[test]
fn relay_hint_does_not_hide_local_pending_write() {
    let mut s = store();
    s.add_pending(at(3, 4), RED);
    assert_eq!(s.upsert(Cell::relayed(at(3, 4), BLUE, "bob")), MergeOutcome::Stale);

    let shown = s.get(at(3, 4)).expect("cell");
    assert_eq!(shown.owner, Owner::Pending);
    assert_eq!(shown.color, RED);
    assert!(s.has_pending(at(3, 4)));
}

#[test]
fn later_relay_hint_does_not_replace_earlier_one() {
    let mut s = store();
    assert_eq!(s.upsert(Cell::relayed(at(8, 8), BLUE, "bob")), MergeOutcome::Applied);
    assert_eq!(s.upsert(Cell::relayed(at(8, 8), GREEN, "carol")), MergeOutcome::Stale);
    assert_eq!(s.get(at(8, 8)).expect("cell").owner, Owner::Account("bob".into()));

    // A confirmation still displaces the hint.
    assert_eq!(s.upsert(confirmed(8, 8, GREEN, "carol", 1)), MergeOutcome::Applied);
    assert_eq!(s.get(at(8, 8)).expect("cell").version, 1);
}

#[test]
fn unpainted_and_out_of_grid_cells_are_ignored() {
    let mut s = store();
    let blank = Cell::relayed(at(1, 1), RED, ZERO_IDENTITY);
    assert_eq!(blank.owner, Owner::Unpainted);
    assert_eq!(s.upsert(blank), MergeOutcome::Ignored);
    assert_eq!(s.upsert(confirmed(1000, 0, RED, "a", 1)), MergeOutcome::Ignored);
    assert!(s.is_empty());
    assert_eq!(s.stats(), MergeStats { applied: 0, stale: 0, ignored: 2 });
}

#[test]
fn stats_count_every_outcome() {
    let mut s = store();
    s.upsert(confirmed(0, 0, RED, "a", 1));
    s.upsert(confirmed(0, 0, RED, "a", 1));
    s.upsert(Cell::relayed(at(0, 0), RED, ""));
    assert_eq!(s.stats(), MergeStats { applied: 1, stale: 1, ignored: 1 });
}

// =============================================================================
// Pending writes
// =============================================================================

#[test]
fn add_pending_covers_confirmed_cell_until_expiry() {
    let mut s = store();
    s.upsert(confirmed(5, 5, GREEN, "alice", 1));
    s.add_pending(at(5, 5), RED).expect("token");
    assert!(s.get(at(5, 5)).expect("cell").is_pending());

    assert!(s.expire_pending(at(5, 5)));
    let cell = s.get(at(5, 5)).expect("cell");
    assert_eq!(cell.color, GREEN);
    assert_eq!(cell.version, 1);
}

#[test]
fn expire_pending_on_blank_cell_removes_it() {
    let mut s = store();
    s.add_pending(at(9, 9), RED);
    assert!(s.expire_pending(at(9, 9)));
    assert!(s.get(at(9, 9)).is_none());
    assert!(s.is_empty());
}

#[test]
fn expire_after_confirmation_is_a_no_op() {
    let mut s = store();
    let token = s.add_pending(at(4, 4), RED).expect("token");
    s.upsert(confirmed(4, 4, RED, "me", 1));
    assert!(!s.expire_pending_token(at(4, 4), token));
    assert!(!s.expire_pending(at(4, 4)));
    assert_eq!(s.get(at(4, 4)).expect("cell").version, 1);
}

#[test]
fn old_token_does_not_remove_newer_pending() {
    let mut s = store();
    let first = s.add_pending(at(4, 4), RED).expect("token");
    let second = s.add_pending(at(4, 4), BLUE).expect("token");
    assert_ne!(first, second);
    assert!(!s.expire_pending_token(at(4, 4), first));
    assert_eq!(s.get(at(4, 4)).expect("cell").color, BLUE);
    assert!(s.expire_pending_token(at(4, 4), second));
    assert!(s.get(at(4, 4)).is_none());
}

#[test]
fn expire_pending_leaves_relay_hints_alone() {
    let mut s = store();
    s.upsert(Cell::relayed(at(1, 2), BLUE, "bob"));
    assert!(!s.expire_pending(at(1, 2)));
    assert!(s.get(at(1, 2)).is_some());
}

#[test]
fn add_pending_outside_grid_is_rejected() {
    let mut s = store();
    assert!(s.add_pending(at(0, 1000), RED).is_none());
    assert!(s.is_empty());
}

#[test]
fn stale_confirmation_does_not_uncover_pending() {
    let mut s = store();
    s.upsert(confirmed(6, 6, GREEN, "a", 2));
    s.add_pending(at(6, 6), RED);
    // An older confirmation is stale and must not reveal itself.
    assert_eq!(s.upsert(confirmed(6, 6, BLUE, "b", 1)), MergeOutcome::Stale);
    assert!(s.has_pending(at(6, 6)));
    assert_eq!(s.upsert(confirmed(6, 6, BLUE, "b", 3)), MergeOutcome::Applied);
    assert!(!s.has_pending(at(6, 6)));
}

// =============================================================================
// Relay hint sweep
// =============================================================================

#[test]
fn sweep_drops_only_old_relay_hints() {
    let mut s = store();
    let t0 = Instant::now();
    s.upsert_at(Cell::relayed(at(1, 1), RED, "bob"), t0);
    s.upsert_at(Cell::relayed(at(2, 2), RED, "bob"), t0 + Duration::from_secs(50));
    s.add_pending(at(3, 3), RED);

    let dropped = s.sweep_unconfirmed_at(t0 + Duration::from_secs(60), Duration::from_secs(60));
    assert_eq!(dropped, 1);
    assert!(s.get(at(1, 1)).is_none());
    assert!(s.get(at(2, 2)).is_some());
    assert!(s.has_pending(at(3, 3)));
}

// =============================================================================
// Change notifications
// =============================================================================

#[test]
fn every_applied_mutation_is_published() {
    let mut s = store();
    let mut rx = s.subscribe();

    let token = s.add_pending(at(3, 4), RED).expect("token");
    s.upsert(confirmed(3, 4, GREEN, "alice", 1));
    s.upsert(confirmed(3, 4, GREEN, "alice", 1));
    s.expire_pending_token(at(3, 4), token);

    let first = rx.try_recv().expect("pending change");
    assert!(first.cell.expect("cell").is_pending());
    let second = rx.try_recv().expect("confirmed change");
    assert_eq!(second.cell.expect("cell").version, 1);
    assert!(rx.try_recv().is_err(), "stale and no-op calls must not publish");
}

#[test]
fn expiry_publishes_blank_cell() {
    let mut s = store();
    s.add_pending(at(0, 0), RED);
    let mut rx = s.subscribe();
    s.expire_pending(at(0, 0));
    assert_eq!(rx.try_recv().expect("change"), CellChange { coord: at(0, 0), cell: None });
}

// =============================================================================
// Cursors
// =============================================================================

#[test]
fn cursors_expire_after_ttl() {
    let mut s = store();
    let t0 = Instant::now();
    s.update_cursor_at("s-1", 10, 10, RED, t0);
    s.update_cursor_at("s-2", 20, 20, BLUE, t0 + Duration::from_secs(10));

    let active = s.active_cursors_at(t0 + Duration::from_secs(14));
    assert_eq!(active.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(), vec!["s-1", "s-2"]);

    let active = s.active_cursors_at(t0 + CURSOR_TTL);
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, "s-2");

    assert_eq!(s.sweep_cursors_at(t0 + CURSOR_TTL), 1);
    assert_eq!(s.sweep_cursors_at(t0 + CURSOR_TTL), 0);
}

#[test]
fn cursor_update_refreshes_position_and_age() {
    let mut s = store();
    let t0 = Instant::now();
    s.update_cursor_at("s-1", 1, 1, RED, t0);
    s.update_cursor_at("s-1", 2, 3, GREEN, t0 + Duration::from_secs(14));
    let active = s.active_cursors_at(t0 + Duration::from_secs(20));
    assert_eq!(active.len(), 1);
    assert_eq!((active[0].x, active[0].y, active[0].color), (2, 3, GREEN));
}

#[test]
fn remove_cursor_reports_presence() {
    let mut s = store();
    s.update_cursor("s-1", 1, 1, RED);
    assert!(s.remove_cursor("s-1"));
    assert!(!s.remove_cursor("s-1"));
    assert!(s.active_cursors().is_empty());
}

// =============================================================================
// Owner / shared handle
// =============================================================================

#[test]
fn owner_from_identity_recognises_sentinels() {
    assert_eq!(Owner::from_identity(""), Owner::Unpainted);
    assert_eq!(Owner::from_identity(ZERO_IDENTITY), Owner::Unpainted);
    assert_eq!(Owner::from_identity("pending"), Owner::Pending);
    assert_eq!(Owner::from_identity("0xabc"), Owner::Account("0xabc".into()));
    assert_eq!(Owner::Pending.identity(), "pending");
}

#[test]
fn shared_store_clones_see_the_same_state() {
    let shared = SharedCellStore::new(store());
    let other = shared.clone();
    shared.lock().upsert(confirmed(1, 1, RED, "a", 1));
    assert_eq!(other.lock().len(), 1);
}
