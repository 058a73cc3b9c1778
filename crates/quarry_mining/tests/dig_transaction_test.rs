//! Integration tests for the dig transaction through registry and ledger.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;

use quarry_mining::{
    Catalog, DigRecord, EconomyGateway, Ledger, MineRegistry, MineSnapshot, MineState,
    MiningConfig, MiningError, Tool, ESCAPE_TOKEN,
};

const CATALOG: &str = r#"
[cards]
fireball = 3.0
shield = 1.0

[items]
gold = 1.0
"#;

fn config(seed: u64) -> MiningConfig {
    MiningConfig::from_toml_str(&format!("[registry]\nid_space = 500\nseed = {seed}\n")).unwrap()
}

fn catalog() -> Catalog {
    Catalog::from_toml_str(CATALOG).unwrap()
}

fn mine(id: u32, owner: u64, fee: u64, collapse_prob: f64) -> MineSnapshot {
    MineSnapshot {
        id,
        owner,
        location: 0,
        starting_capital: 600,
        stability: 95.0,
        oof_rate: 0.0,
        card_rate: 10.0,
        item_rate: 10.0,
        breadth: 1,
        fee,
        depth: 0,
        collapse_prob,
        income: 0,
        distributions: catalog().default_distributions(),
        status: Vec::new(),
        state: MineState::Active,
    }
}

fn setup(mines: &[MineSnapshot]) -> (MineRegistry, Arc<Ledger>) {
    setup_with(config(1), mines)
}

fn setup_with(config: MiningConfig, mines: &[MineSnapshot]) -> (MineRegistry, Arc<Ledger>) {
    let ledger = Arc::new(Ledger::in_memory());
    for snapshot in mines {
        ledger.open_mine(snapshot).unwrap();
    }
    let registry = MineRegistry::bootstrap(config, catalog(), ledger.clone()).unwrap();
    (registry, ledger)
}

/// A mine at probability zero under this config survives one step, then
/// collapses. Every channel pays on the surviving step.
fn one_step_setup() -> (MineRegistry, Arc<Ledger>) {
    let mut config = config(1);
    config.ratchet.base = 1e9;
    let mut generous = mine(5, 1, 30, 0.0);
    generous.oof_rate = 1.0;
    generous.card_rate = 1_000.0;
    generous.item_rate = 1_000.0;
    let (registry, ledger) = setup_with(config, &[generous]);
    ledger.deposit(2, 100).unwrap();
    (registry, ledger)
}

#[test]
fn test_fresh_mine_invariants_over_many_digs() {
    let ledger = Arc::new(Ledger::in_memory());
    let registry = MineRegistry::new(config(42), catalog(), ledger.clone()).unwrap();
    ledger.deposit(2, u64::MAX / 2).unwrap();

    let handle = registry.create(1, 77, 800).unwrap();
    let opened = handle.snapshot().unwrap();
    assert_eq!(opened.fee, 40);
    assert_eq!(opened.location, 77);
    assert!((5.0..=95.0).contains(&opened.stability));
    assert_eq!(opened.distributions.len(), 3);

    let tool = Tool::new(8.0, 6.0);
    let mut last = opened;
    let mut paid = 0;
    for _ in 0..300 {
        let record = handle.dig(2, &tool, &[]).unwrap();
        paid += record.toll;
        if record.collapsed {
            assert!(registry.get(handle.id()).is_err());
            assert_eq!(ledger.collapsed().len(), 1);
            return;
        }
        let now = handle.snapshot().unwrap();
        assert!(now.depth >= last.depth);
        assert!(now.collapse_prob >= last.collapse_prob);
        assert!(now.collapse_prob <= 1.0);
        assert!(now.breadth >= 1);
        assert_eq!(now.income, paid);
        last = now;
    }
    assert_eq!(ledger.dig_sheet(handle.id()).len(), 300);
}

#[test]
fn test_insufficient_funds_is_side_effect_free() {
    let (registry, ledger) = setup(&[mine(9, 1, 50, 0.0)]);
    ledger.deposit(2, 10).unwrap();
    let before = registry.snapshot(9).unwrap();

    let err = registry
        .get(9)
        .unwrap()
        .dig(2, &Tool::new(10.0, 5.0), &[])
        .unwrap_err();

    assert_eq!(
        err,
        MiningError::InsufficientFunds {
            user: 2,
            required: 50,
            available: 10
        }
    );
    assert_eq!(registry.snapshot(9).unwrap(), before);
    assert_eq!(ledger.mine(9), Some(before));
    assert_eq!(ledger.balance(2), 10);
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_collapse_removes_mine_and_books_statistics() {
    let (registry, ledger) = setup(&[mine(4, 1, 30, 1.0)]);
    ledger.deposit(2, 100).unwrap();

    let handle = registry.get(4).unwrap();
    let record = handle.dig(2, &Tool::new(10.0, 5.0), &[]).unwrap();

    assert!(record.collapsed);
    assert_eq!(record.income, 0);
    assert!(record.rewards.is_empty());
    assert_eq!(ledger.balance(2), 70);

    assert!(matches!(registry.get(4), Err(MiningError::MineNotFound(4))));
    assert!(matches!(
        handle.dig(2, &Tool::new(10.0, 5.0), &[]),
        Err(MiningError::MineNotFound(4))
    ));
    // The toll of a dig on a dead mine is never charged.
    assert_eq!(ledger.balance(2), 70);

    let archive = ledger.collapsed();
    assert_eq!(archive.len(), 1);
    assert_eq!(archive[0].owner, 1);
    assert_eq!(archive[0].victim, 2);
    assert_eq!(archive[0].income, 30);

    let owner = ledger.miner(1).unwrap();
    assert_eq!(owner.deepest_keep, Some(0));
    assert_eq!(owner.fastest_collapse, Some(0));
    assert_eq!(owner.max_income, 30);
    assert_eq!(owner.break_even, 0);
    assert_eq!(ledger.miner(2).unwrap().shallowest_collapse, Some(1));
}

#[test]
fn test_escape_boost_is_recorded_on_collapse() {
    let (registry, ledger) = setup(&[mine(4, 1, 0, 1.0)]);

    let record = registry
        .get(4)
        .unwrap()
        .dig(2, &Tool::new(10.0, 5.0), &[ESCAPE_TOKEN])
        .unwrap();

    assert!(record.collapsed);
    assert_eq!(record.boosts, vec![ESCAPE_TOKEN.to_string()]);
    assert_eq!(ledger.miner(2).unwrap().collapse_count, 1);
    assert_eq!(ledger.miner(1).unwrap().break_even, 1);
}

#[test]
fn test_escaped_collapse_keeps_rewards_and_credits_income() {
    let (registry, ledger) = one_step_setup();

    let record = registry
        .get(5)
        .unwrap()
        .dig(2, &Tool::new(10.0, 5.0), &[ESCAPE_TOKEN])
        .unwrap();

    assert!(record.collapsed);
    assert_eq!(record.toll, 30);
    assert_eq!(record.depth_gained, 1);
    assert_eq!(record.income, 30);
    assert_eq!(record.rewards.cards.values().sum::<u32>(), 1);
    assert_eq!(record.rewards.items, vec!["gold".to_string()]);
    assert_eq!(ledger.balance(2), 100 - record.toll + record.income);
    assert!(registry.get(5).is_err());
    assert_eq!(ledger.collapsed()[0].mine_id, 5);
}

#[test]
fn test_collapse_without_escape_forfeits_everything() {
    let (registry, ledger) = one_step_setup();

    let record = registry.get(5).unwrap().dig(2, &Tool::new(10.0, 5.0), &[]).unwrap();

    assert!(record.collapsed);
    assert_eq!(record.depth_gained, 1);
    assert_eq!(record.income, 0);
    assert!(record.rewards.is_empty());
    assert_eq!(ledger.balance(2), 70);
}

#[test]
fn test_tool_without_reach_still_pays() {
    let (registry, ledger) = setup(&[mine(6, 1, 12, 0.0)]);
    ledger.deposit(3, 12).unwrap();

    let record = registry.get(6).unwrap().dig(3, &Tool::new(0.1, 0.1), &[]).unwrap();

    assert_eq!(record.steps, 0);
    assert_eq!(record.depth_gained, 0);
    assert!(!record.collapsed);
    assert_eq!(ledger.balance(3), 0);
    assert_eq!(registry.snapshot(6).unwrap().income, 12);
}

#[test]
fn test_different_mines_dig_in_parallel() {
    let mines: Vec<MineSnapshot> = (1..=4).map(|id| mine(id, 1, 2, 0.0)).collect();
    let (registry, ledger) = setup(&mines);
    for miner in 100..104 {
        ledger.deposit(miner, 10_000).unwrap();
    }

    let tool = Tool::new(2.0, 1_000.0);
    let handles: Vec<_> = (1..=4u32)
        .zip(100..104u64)
        .map(|(id, miner)| {
            let registry = registry.clone();
            thread::spawn(move || {
                let handle = registry.get(id).unwrap();
                (0..10)
                    .map(|_| handle.dig(miner, &tool, &[]).unwrap())
                    .collect::<Vec<DigRecord>>()
            })
        })
        .collect();

    for (id, worker) in (1..=4u32).zip(handles) {
        let records = worker.join().unwrap();
        assert!(records.iter().all(|r| r.mine_id == id && !r.collapsed));
        let depth: u64 = records.iter().map(|r| r.depth_gained).sum();
        assert_eq!(registry.snapshot(id).unwrap().depth, depth);
        assert_eq!(ledger.dig_sheet(id).len(), 10);
    }
}

#[test]
fn test_level_limit_follows_active_mines() {
    let (registry, _) = setup(&[mine(4, 1, 0, 1.0)]);

    // Level 3 allows one mine and owner 1 already runs one.
    assert!(matches!(
        registry.create_for_level(1, 0, 300, 3),
        Err(MiningError::ConcurrentLimitExceeded { active: 1, limit: 1, .. })
    ));

    registry.get(4).unwrap().dig(2, &Tool::new(10.0, 5.0), &[]).unwrap();
    assert_eq!(registry.count_by_owner(1), 0);

    let reopened = registry.create_for_level(1, 0, 300, 3).unwrap();
    assert_ne!(reopened.id(), 4);
}

#[test]
fn test_distribution_weights_skip_foreign_names() {
    let mut snapshot = mine(8, 1, 0, 0.0);
    snapshot.distributions = BTreeMap::from([("not_a_card".to_string(), 5.0)]);
    snapshot.card_rate = 100.0;
    snapshot.item_rate = 100.0;
    let (registry, _) = setup(&[snapshot]);

    let handle = registry.get(8).unwrap();
    for _ in 0..20 {
        let record = handle.dig(2, &Tool::new(5.0, 50.0), &[]).unwrap();
        assert!(record.rewards.is_empty());
        if record.collapsed {
            break;
        }
    }
}
