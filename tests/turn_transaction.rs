use serde_json::json;
use turndb::{
    ApplyResult, Command, EngineConfig, LogEntry, RowId, RuntimeMeta, SheetPatch, TableRow,
    TurnEngine, TurnOptions, TurnState, TxStatus, apply_turn_transaction, should_use_transaction,
};

#[derive(Debug, Clone)]
struct GameState {
    hp: i64,
    location: String,
    meta: Option<RuntimeMeta>,
}

impl GameState {
    fn new(hp: i64) -> Self {
        Self {
            hp,
            location: "据点".to_string(),
            meta: None,
        }
    }

    fn with_meta(mut self, meta: RuntimeMeta) -> Self {
        self.meta = Some(meta);
        self
    }
}

impl TurnState for GameState {
    fn runtime_meta(&self) -> Option<&RuntimeMeta> {
        self.meta.as_ref()
    }

    fn set_runtime_meta(&mut self, meta: RuntimeMeta) {
        self.meta = Some(meta);
    }
}

fn row(value: serde_json::Value) -> TableRow {
    value.as_object().cloned().expect("object literal")
}

fn system_log(text: &str) -> LogEntry {
    LogEntry::system("sys-1", text)
}

fn combat_commands() -> Vec<Command> {
    vec![
        Command::new("set_action_economy").with_payload(json!({"回合": 3, "资源": []})),
        Command::new("resolve_attack_check").with_payload(json!({"行动者": "A"})),
    ]
}

#[test]
fn routing_ignores_single_commands() {
    let options = TurnOptions::default();
    assert!(!should_use_transaction(&[Command::new("set_initiative")], &options));
}

#[test]
fn routing_detects_transactional_action_pairs() {
    // Two commands from the default transactional set, no flags or markers.
    let commands = vec![Command::new("set_initiative"), Command::new("set_initiative")];
    assert!(should_use_transaction(&commands, &TurnOptions::default()));

    // One transactional action alone does not trigger.
    let mixed = vec![Command::new("set_initiative"), Command::new("set")];
    assert!(!should_use_transaction(&mixed, &TurnOptions::default()));
}

#[test]
fn routing_honors_flags_markers_and_custom_sets() {
    let flagged = vec![Command::new("set"), Command::new("set").atomic()];
    assert!(should_use_transaction(&flagged, &TurnOptions::default()));

    let shared_marker = vec![
        Command::new("set").with_marker("turn-2"),
        Command::new("set").with_marker("turn-2"),
    ];
    assert!(should_use_transaction(&shared_marker, &TurnOptions::default()));

    // Distinct markers do not group.
    let distinct = vec![
        Command::new("set").with_marker("turn-2"),
        Command::new("set").with_marker("turn-3"),
    ];
    assert!(!should_use_transaction(&distinct, &TurnOptions::default()));

    let custom = TurnOptions::default().with_transactional_actions(["Custom_Step"]);
    let customized = vec![Command::new("custom_step"), Command::new("custom_step")];
    assert!(should_use_transaction(&customized, &custom));
    assert!(!should_use_transaction(&customized, &TurnOptions::default()));

    let forced = TurnOptions::force_atomic();
    assert!(should_use_transaction(&distinct, &forced));
}

#[test]
fn empty_batch_is_identity() {
    let base = GameState::new(10);
    let outcome =
        apply_turn_transaction(&base, &[], |state, _| ApplyResult::new(state.clone()), &TurnOptions::default())
            .unwrap();
    assert!(!outcome.has_error);
    assert!(!outcome.rolled_back);
    assert_eq!(outcome.applied_patches, 0);
    assert!(outcome.logs.is_empty());
    assert!(outcome.new_state.meta.is_none());
}

#[test]
fn rolls_back_when_atomic_batch_reports_error() {
    let base = GameState::new(10);
    let outcome = apply_turn_transaction(
        &base,
        &combat_commands(),
        |state, _| {
            let mut next = state.clone();
            next.hp = 0;
            ApplyResult::new(next)
                .with_error()
                .with_logs(vec![system_log("指令验证失败 [resolve_attack_check]: invalid payload")])
        },
        &TurnOptions::default(),
    )
    .unwrap();

    assert!(outcome.rolled_back);
    assert!(outcome.has_error);
    assert_eq!(outcome.new_state.hp, 10);
    assert!(outcome.logs.iter().any(|log| log.text.contains("回合事务回滚")));

    let journal = &outcome.new_state.meta.as_ref().unwrap().tx_journal;
    let last = journal.back().unwrap();
    assert_eq!(last.status, TxStatus::RolledBack);
    assert_eq!(last.reason.as_deref(), Some("apply_error"));
    assert_eq!(last.command_count, 2);
}

#[test]
fn error_sniffing_rolls_back_without_explicit_flag() {
    let base = GameState::new(10);
    let outcome = apply_turn_transaction(
        &base,
        &combat_commands(),
        |state, _| {
            ApplyResult::new(state.clone()).with_logs(vec![system_log("掷骰结果异常")])
        },
        &TurnOptions::default(),
    )
    .unwrap();
    assert!(outcome.rolled_back);
    assert!(outcome.has_error);
}

#[test]
fn keeps_fast_path_result_even_when_command_errors() {
    let base = GameState::new(10);
    let commands = vec![Command::new("set").with_payload(json!({"key": "当前地点", "value": "B"}))];

    let outcome = apply_turn_transaction(
        &base,
        &commands,
        |state, _| {
            let mut next = state.clone();
            next.location = "B".to_string();
            ApplyResult::new(next)
                .with_error()
                .with_logs(vec![system_log("路径更新失败")])
        },
        &TurnOptions::default(),
    )
    .unwrap();

    assert!(!outcome.rolled_back);
    assert_eq!(outcome.new_state.location, "B");
    assert!(outcome.has_error);
}

#[test]
fn fast_path_still_bumps_table_versions() {
    // Scenario: a single command with patches skips atomic wrapping but the
    // store bookkeeping still runs.
    let base = GameState::new(10);
    let commands = vec![Command::new("set")];

    let outcome = apply_turn_transaction(
        &base,
        &commands,
        |state, _| {
            ApplyResult::new(state.clone()).with_patches(vec![SheetPatch::upsert(
                "ITEM_Inventory",
                "I1",
                row(json!({"物品ID": "I1", "数量": 1})),
            )])
        },
        &TurnOptions::default(),
    )
    .unwrap();

    assert!(!outcome.rolled_back);
    assert_eq!(outcome.applied_patches, 1);
    let meta = outcome.new_state.meta.as_ref().unwrap();
    assert_eq!(meta.sheet_versions["ITEM_Inventory"], 1);
    assert_eq!(meta.row_versions["ITEM_Inventory::I1"], 1);
    assert_eq!(meta.last_trace().unwrap().status, TxStatus::Committed);
    // Fast-path commits are traced but not narrated.
    assert!(outcome.logs.is_empty());
}

#[test]
fn fast_path_conflict_rejects_turn_with_metadata_correction() {
    let meta = RuntimeMeta {
        sheet_versions: [("LOG_Summary".into(), 5u64)].into_iter().collect(),
        ..RuntimeMeta::default()
    };
    let base = GameState::new(10).with_meta(meta);
    let commands = vec![Command::new("set")];

    let outcome = apply_turn_transaction(
        &base,
        &commands,
        |state, _| {
            let mut next = state.clone();
            next.hp = 9;
            ApplyResult::new(next).with_patches(vec![
                SheetPatch::upsert("LOG_Summary", "AM0009", row(json!({"编码索引": "AM0009"})))
                    .with_expected_sheet_version(4)
                    .with_source("ms:memory"),
            ])
        },
        &TurnOptions::default(),
    )
    .unwrap();

    assert!(outcome.rolled_back);
    assert!(outcome.has_error);
    assert_eq!(outcome.applied_patches, 0);
    // Pure applier contract: the business state is the base again.
    assert_eq!(outcome.new_state.hp, 10);
    let meta = outcome.new_state.meta.as_ref().unwrap();
    assert!(meta.conflict_stats.total >= 1);
    assert_eq!(meta.last_trace().unwrap().status, TxStatus::Blocked);
}

#[test]
fn rolls_back_on_stale_sheet_version_in_atomic_batch() {
    let meta = RuntimeMeta {
        sheet_versions: [("LOG_Summary".into(), 5u64)].into_iter().collect(),
        ..RuntimeMeta::default()
    };
    let base = GameState::new(10).with_meta(meta);

    let outcome = apply_turn_transaction(
        &base,
        &combat_commands(),
        |state, _| {
            let mut next = state.clone();
            next.hp = 9;
            ApplyResult::new(next).with_patches(vec![
                SheetPatch::upsert("LOG_Summary", "AM0009", row(json!({"编码索引": "AM0009", "摘要": "conflict"})))
                    .with_expected_sheet_version(4)
                    .with_source("ms:memory"),
            ])
        },
        &TurnOptions::default(),
    )
    .unwrap();

    assert!(outcome.rolled_back);
    assert!(outcome.has_error);
    assert_eq!(outcome.new_state.hp, 10);
    assert!(outcome.logs.iter().any(|log| log.text.contains("并发冲突")));

    let meta = outcome.new_state.meta.as_ref().unwrap();
    assert!(meta.conflict_stats.total >= 1);
    let last = meta.last_trace().unwrap();
    assert_eq!(last.status, TxStatus::Blocked);
    assert_eq!(last.reason.as_deref(), Some("sheet_version_conflict"));
}

#[test]
fn commits_and_updates_runtime_meta() {
    let meta = RuntimeMeta {
        sheet_versions: [("LOG_Summary".into(), 1u64)].into_iter().collect(),
        ..RuntimeMeta::default()
    };
    let base = GameState::new(10).with_meta(meta);

    let outcome = apply_turn_transaction(
        &base,
        &combat_commands(),
        |state, _| {
            let mut next = state.clone();
            next.hp = 9;
            ApplyResult::new(next).with_patches(vec![
                SheetPatch::upsert("LOG_Summary", "AM0010", row(json!({"编码索引": "AM0010", "摘要": "ok"})))
                    .with_expected_sheet_version(1)
                    .with_source("ms:memory"),
            ])
        },
        &TurnOptions::default(),
    )
    .unwrap();

    assert!(!outcome.rolled_back);
    assert!(!outcome.has_error);
    assert_eq!(outcome.new_state.hp, 9);
    assert_eq!(outcome.applied_patches, 1);
    assert!(outcome.logs.iter().any(|log| log.text.contains("回合事务提交成功")));

    let meta = outcome.new_state.meta.as_ref().unwrap();
    assert_eq!(meta.sheet_versions["LOG_Summary"], 2);
    let last = meta.last_trace().unwrap();
    assert_eq!(last.status, TxStatus::Committed);
    assert_eq!(last.patch_count, 1);
    assert!(last.sources.iter().any(|s| s == "set_action_economy"));
}

#[test]
fn atomicity_hides_earlier_command_effects() {
    // N commands routed atomically; the last one fails, so nothing from the
    // earlier ones is visible in the returned state.
    let base = GameState::new(10);
    let outcome = apply_turn_transaction(
        &base,
        &combat_commands(),
        |state, commands| {
            let mut next = state.clone();
            next.hp -= 5; // command 1 effect
            next.location = "战场".to_string(); // command 2 effect
            let mut result = ApplyResult::new(next);
            if commands.len() > 1 {
                result = result.with_error();
            }
            result
        },
        &TurnOptions::default(),
    )
    .unwrap();

    assert!(outcome.rolled_back);
    assert_eq!(outcome.new_state.hp, base.hp);
    assert_eq!(outcome.new_state.location, base.location);
    // Only the journal trace distinguishes the returned state from the base.
    assert!(outcome.new_state.meta.as_ref().unwrap().last_trace().is_some());
}

#[test]
fn in_batch_row_version_conflict_rolls_back_whole_batch() {
    // patch1 bumps R1 to rowVersion=1; patch2 expects rowVersion=0 in the
    // same batch. The whole batch is rejected and the metadata shows no
    // trace of patch1's bump.
    let base = GameState::new(10);
    let outcome = apply_turn_transaction(
        &base,
        &combat_commands(),
        |state, _| {
            ApplyResult::new(state.clone()).with_patches(vec![
                SheetPatch::upsert("NPC_Registry", "R1", row(json!({"NPC_ID": "R1", "hp": 5}))),
                SheetPatch::upsert("NPC_Registry", "R1", row(json!({"NPC_ID": "R1", "hp": 4})))
                    .with_expected_row_version(0),
            ])
        },
        &TurnOptions::default(),
    )
    .unwrap();

    assert!(outcome.rolled_back);
    assert_eq!(outcome.applied_patches, 0);
    let meta = outcome.new_state.meta.as_ref().unwrap();
    assert!(!meta.sheet_versions.contains_key("NPC_Registry"));
    assert!(!meta.row_versions.contains_key("NPC_Registry::R1"));
    assert_eq!(
        meta.last_trace().unwrap().reason.as_deref(),
        Some("row_version_conflict")
    );
}

#[test]
fn source_gating_blocks_foreign_writers() {
    let base = GameState::new(10);
    let patch = |source: Option<&str>| {
        let mut p = SheetPatch::upsert("LOG_Summary", "AM0011", row(json!({"编码索引": "AM0011"})));
        if let Some(source) = source {
            p = p.with_source(source);
        }
        vec![p]
    };

    // Unset source passes (legacy compatibility).
    let unset = apply_turn_transaction(
        &base,
        &combat_commands(),
        |state, _| ApplyResult::new(state.clone()).with_patches(patch(None)),
        &TurnOptions::default(),
    )
    .unwrap();
    assert!(!unset.rolled_back);

    // The memory-writer prefix passes.
    let allowed = apply_turn_transaction(
        &base,
        &combat_commands(),
        |state, _| ApplyResult::new(state.clone()).with_patches(patch(Some("ms:memory:v2"))),
        &TurnOptions::default(),
    )
    .unwrap();
    assert!(!allowed.rolled_back);

    // Any other declared source blocks the whole batch.
    let blocked = apply_turn_transaction(
        &base,
        &combat_commands(),
        |state, _| {
            ApplyResult::new(state.clone()).with_patches(vec![
                SheetPatch::upsert("LOG_Summary", "AM0011", row(json!({"编码索引": "AM0011"})))
                    .with_source("ms:state"),
                SheetPatch::upsert("ITEM_Inventory", "I1", row(json!({"物品ID": "I1"}))),
            ])
        },
        &TurnOptions::default(),
    )
    .unwrap();
    assert!(blocked.rolled_back);
    assert_eq!(blocked.applied_patches, 0);
    assert!(blocked.logs.iter().any(|log| log.text.contains("source_not_allowed")));
    let meta = blocked.new_state.meta.as_ref().unwrap();
    assert_eq!(meta.last_trace().unwrap().reason.as_deref(), Some("source_not_allowed"));
    // The unrelated inventory patch was not applied either.
    assert!(!meta.sheet_versions.contains_key("ITEM_Inventory"));
}

#[test]
fn committed_memory_rows_acquire_auto_lock() {
    let base = GameState::new(10);
    let outcome = apply_turn_transaction(
        &base,
        &combat_commands(),
        |state, _| {
            ApplyResult::new(state.clone()).with_patches(vec![
                SheetPatch::upsert("LOG_Summary", "am0007", row(json!({"编码索引": "AM0007"})))
                    .with_source("ms:memory"),
            ])
        },
        &TurnOptions::default(),
    )
    .unwrap();

    let meta = outcome.new_state.meta.as_ref().unwrap();
    let lock = meta
        .row_locks
        .iter()
        .find(|lock| lock.sheet_id == "LOG_Summary")
        .expect("auto lock present");
    assert_eq!(lock.row_id, RowId::from("AM0007"));
    assert_eq!(lock.owner.as_deref(), Some("am-special"));
    assert_eq!(lock.reason.as_deref(), Some("memory-autolock"));

    // The pin holds: a later foreign-owner write on that row is blocked.
    let next_base = outcome.new_state.clone();
    let blocked = apply_turn_transaction(
        &next_base,
        &combat_commands(),
        |state, _| {
            ApplyResult::new(state.clone()).with_patches(vec![
                SheetPatch::upsert("LOG_Summary", "AM0007", row(json!({"编码索引": "AM0007", "纪要": "重写"})))
                    .with_source("ms:memory")
                    .with_lock_owner("ms:memory"),
            ])
        },
        &TurnOptions::default(),
    )
    .unwrap();
    assert!(blocked.rolled_back);
}

#[test]
fn journal_is_bounded() {
    let config = EngineConfig::default().with_journal_limit(5);
    let engine = TurnEngine::new(config);
    let mut state = GameState::new(10);

    for i in 0..8 {
        let outcome = engine
            .apply(
                &state,
                &[Command::new("set")],
                |s, _| {
                    ApplyResult::new(s.clone()).with_patches(vec![SheetPatch::upsert(
                        "ECON_Ledger",
                        format!("E{i}"),
                        row(json!({"ledger_id": format!("E{i}")})),
                    )])
                },
                &TurnOptions::default(),
            )
            .unwrap();
        state = outcome.new_state;
    }

    let journal = &state.meta.as_ref().unwrap().tx_journal;
    assert_eq!(journal.len(), 5);
    assert!(journal.iter().all(|trace| trace.status == TxStatus::Committed));
}
