//! End-to-end scenarios over the in-memory store backend

use rugcache::prelude::*;
use rugcache::config::{CacheConfig, MonitoringConfig, WarmingConfig};
use rugcache::keys;
use std::sync::Arc;

struct Stack {
    store: Arc<rugcache::store::InMemoryStore>,
    cache: Arc<MultiLevelCache>,
    invalidation: Arc<SmartInvalidation>,
    atomic: AtomicOperations,
    registry: TraitRegistry,
    warmer: PredictiveWarmer,
    entities: Entities,
}

fn stack() -> Stack {
    let store = Arc::new(rugcache::store::InMemoryStore::new());
    let cache_config = CacheConfig::default();
    let policy = cache_config.ttl.clone();
    let cache = Arc::new(MultiLevelCache::new(store.clone(), cache_config));
    let invalidation = Arc::new(SmartInvalidation::new(store.clone(), cache.clone(), &policy));
    let monitoring = Arc::new(Monitoring::new(
        store.clone(),
        cache.clone(),
        MonitoringConfig::default(),
    ));
    let atomic = AtomicOperations::new(store.clone(), invalidation.clone(), monitoring);
    let registry = TraitRegistry::new(store.clone());
    let warmer = PredictiveWarmer::new(store.clone(), cache.clone(), WarmingConfig::default());
    let entities = Entities::new(store.clone());
    Stack {
        store,
        cache,
        invalidation,
        atomic,
        registry,
        warmer,
        entities,
    }
}

fn contract() -> ContractId {
    ContractId::new(8453, "0xrug").unwrap()
}

fn mint_spec(number: u64, owner: &str, traits: Vec<TraitId>) -> MintSpec {
    MintSpec {
        token_number: number,
        owner: owner.to_string(),
        name: format!("Rug #{number}"),
        description: "woven onchain".to_string(),
        image: format!("ipfs://rug/{number}"),
        animation_url: String::new(),
        traits,
    }
}

mod transfer_scenarios {
    use super::*;

    #[tokio::test]
    async fn transfer_moves_sets_and_invalidates_cache() {
        let s = stack();
        let c = contract();
        let result = s.atomic.batch_mint(&c, vec![mint_spec(42, "0xa", vec![])]).await;
        assert!(result.success);
        let token = TokenId::new(8453, "0xrug", 42).unwrap();

        // Populate the cache through the fetch hook (the blockchain-read
        // collaborator boundary).
        let ttl = s.cache.policy().token;
        let entities = s.entities.clone();
        let fetch_token = token.clone();
        let lookup = s
            .cache
            .get_or_fetch(&keys::cache_token(&token), &ttl, move || async move {
                let record = entities.get_token(&fetch_token).await?.unwrap();
                Ok(serde_json::json!({"owner": record.owner}))
            })
            .await
            .unwrap();
        assert_eq!(lookup.data.unwrap()["owner"], "0xa");

        let result = s.atomic.transfer(&token, "0xa", "0xb").await;
        assert!(result.success, "transfer failed: {:?}", result.error);
        assert_eq!(result.affected_entities.len(), 3);

        assert!(!s
            .store
            .sismember(&keys::user_tokens("0xa"), &token.to_string())
            .await
            .unwrap());
        assert!(s
            .store
            .sismember(&keys::user_tokens("0xb"), &token.to_string())
            .await
            .unwrap());

        // Post-invalidation read misses, then re-fetches the new owner.
        let miss = s.cache.get(&keys::cache_token(&token), &ttl).await;
        assert!(!miss.hit);
        assert_eq!(miss.source, CacheSource::Miss);

        let entities = s.entities.clone();
        let fetch_token = token.clone();
        let refreshed = s
            .cache
            .get_or_fetch(&keys::cache_token(&token), &ttl, move || async move {
                let record = entities.get_token(&fetch_token).await?.unwrap();
                Ok(serde_json::json!({"owner": record.owner}))
            })
            .await
            .unwrap();
        assert_eq!(refreshed.data.unwrap()["owner"], "0xb");
    }

    #[tokio::test]
    async fn wrong_owner_fails_and_leaves_sets_unchanged() {
        let s = stack();
        let c = contract();
        s.atomic.batch_mint(&c, vec![mint_spec(42, "0xc", vec![])]).await;
        let token = TokenId::new(8453, "0xrug", 42).unwrap();

        let result = s.atomic.transfer(&token, "0xa", "0xb").await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("ownership mismatch"));

        assert!(s
            .store
            .sismember(&keys::user_tokens("0xc"), &token.to_string())
            .await
            .unwrap());
        assert!(!s
            .store
            .sismember(&keys::user_tokens("0xb"), &token.to_string())
            .await
            .unwrap());

        let report = s
            .atomic
            .verify_consistency(ConsistencyScope::Token(token))
            .await;
        assert!(report.consistent, "issues: {:?}", report.issues);
    }

    #[tokio::test]
    async fn ownership_invariant_holds_across_transfers() {
        let s = stack();
        let c = contract();
        s.atomic
            .batch_mint(
                &c,
                (1..=5u64).map(|n| mint_spec(n, "0xa", vec![])).collect(),
            )
            .await;

        for n in 1..=5u64 {
            let token = TokenId::new(8453, "0xrug", n).unwrap();
            let result = s.atomic.transfer(&token, "0xa", "0xb").await;
            assert!(result.success);
        }

        let report = s
            .atomic
            .verify_consistency(ConsistencyScope::Sample {
                contract: c,
                size: 5,
            })
            .await;
        assert!(report.consistent, "issues: {:?}", report.issues);
        assert_eq!(s.entities.user_tokens("0xb").await.unwrap().len(), 5);
        assert!(s.entities.user_tokens("0xa").await.unwrap().is_empty());
    }
}

mod rollback_scenarios {
    use super::*;

    #[tokio::test]
    async fn partial_pipeline_failure_rolls_back_owner_and_sets() {
        let s = stack();
        let c = contract();
        s.atomic.batch_mint(&c, vec![mint_spec(42, "0xa", vec![])]).await;
        let token = TokenId::new(8453, "0xrug", 42).unwrap();

        // Poison the receiver's token set with a string value: the SAdd in the
        // transfer pipeline fails while earlier commands apply.
        s.store
            .set(&keys::user_tokens("0xb"), "poisoned")
            .await
            .unwrap();

        let result = s.atomic.transfer(&token, "0xa", "0xb").await;
        assert!(!result.success);
        assert!(result
            .error
            .as_deref()
            .unwrap()
            .contains("partial pipeline failure"));
        assert!(!result.partial_failures.is_empty());

        // Compensation restored the owner field and the sender's set.
        assert_eq!(
            s.store
                .hget(&keys::token(&token), "owner")
                .await
                .unwrap()
                .as_deref(),
            Some("0xa")
        );
        assert!(s
            .store
            .sismember(&keys::user_tokens("0xa"), &token.to_string())
            .await
            .unwrap());
    }
}

mod maintenance_scenarios {
    use super::*;

    #[tokio::test]
    async fn cleaning_resets_dirt_and_index_score() {
        let s = stack();
        let c = contract();
        s.atomic.batch_mint(&c, vec![mint_spec(7, "0xowner", vec![])]).await;
        let token = TokenId::new(8453, "0xrug", 7).unwrap();

        let mut record = s.entities.get_token(&token).await.unwrap().unwrap();
        record.dynamic.dirt_level = 80;
        s.entities.put_token(&record).await.unwrap();
        let indexes = IndexManager::new(s.store.clone());
        indexes.set_dirt_level(&c, &token, 80).await.unwrap();

        let result = s
            .atomic
            .maintenance(&token, "0xowner", MaintenanceKind::Cleaning, None)
            .await;
        assert!(result.success);

        let updated = s.entities.get_token(&token).await.unwrap().unwrap();
        assert_eq!(updated.dynamic.dirt_level, 0);
        assert_eq!(updated.dynamic.cleaning_count, 1);

        let score = s
            .store
            .zscore(&keys::tokens_by_dirt_level(&c), &token.to_string())
            .await
            .unwrap();
        assert_eq!(score, Some(0.0));

        // Maintenance invalidation left the recently-maintained marker for
        // the warmer.
        assert!(s
            .store
            .get(&keys::recent_maintenance(&token))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn maintenance_shortlist_surfaces_worn_tokens() {
        let s = stack();
        let c = contract();
        s.atomic
            .batch_mint(
                &c,
                (1..=3u64).map(|n| mint_spec(n, "0xa", vec![])).collect(),
            )
            .await;
        let indexes = IndexManager::new(s.store.clone());
        let worn = TokenId::new(8453, "0xrug", 2).unwrap();
        indexes.set_dirt_level(&c, &worn, 95).await.unwrap();

        let shortlist = indexes.tokens_needing_maintenance(&c, 2).await.unwrap();
        assert_eq!(shortlist[0], worn.to_string());
    }
}

mod trait_query_scenarios {
    use super::*;

    #[tokio::test]
    async fn extra_filter_narrows_results() {
        let s = stack();
        let c = contract();

        let arctic = TraitDefinition::new("palette", TraitValue::Color("Arctic".to_string()));
        let gold = TraitDefinition::new("frame", TraitValue::Color("Gold".to_string()));
        let arctic_id = s.registry.register_trait(&arctic, &c).await.unwrap();
        let gold_id = s.registry.register_trait(&gold, &c).await.unwrap();

        // Three arctic rugs, two of them gold-framed.
        s.atomic
            .batch_mint(
                &c,
                vec![
                    mint_spec(1, "0xa", vec![arctic_id.clone()]),
                    mint_spec(2, "0xa", vec![arctic_id.clone(), gold_id.clone()]),
                    mint_spec(3, "0xb", vec![arctic_id.clone(), gold_id.clone()]),
                ],
            )
            .await;

        let one = vec![TraitFilter {
            trait_type: "palette".to_string(),
            value: TraitValue::Color("Arctic".to_string()),
        }];
        let two = vec![
            TraitFilter {
                trait_type: "palette".to_string(),
                value: TraitValue::Color("Arctic".to_string()),
            },
            TraitFilter {
                trait_type: "frame".to_string(),
                value: TraitValue::Color("Gold".to_string()),
            },
        ];

        let broad = s.registry.find_tokens_by_traits(&one, 50).await.unwrap();
        let narrow = s.registry.find_tokens_by_traits(&two, 50).await.unwrap();

        assert_eq!(broad.len(), 3);
        assert_eq!(narrow.len(), 2);
        for token in &narrow {
            assert!(broad.contains(token), "{token} missing from broader result");
        }
    }

    #[tokio::test]
    async fn trait_membership_invariant_holds_after_update() {
        let s = stack();
        let c = contract();
        let arctic = TraitId::from_raw("palette", "Arctic").unwrap();
        let rust = TraitId::from_raw("palette", "Rust").unwrap();
        s.atomic
            .batch_mint(&c, vec![mint_spec(1, "0xa", vec![arctic.clone()])])
            .await;
        let token = TokenId::new(8453, "0xrug", 1).unwrap();

        let result = s
            .atomic
            .trait_update(&token, &[arctic.clone()], &[rust.clone()])
            .await;
        assert!(result.success);

        let report = s
            .atomic
            .verify_consistency(ConsistencyScope::Token(token.clone()))
            .await;
        assert!(report.consistent, "issues: {:?}", report.issues);
        assert!(!s
            .store
            .sismember(&keys::trait_tokens(&arctic), &token.to_string())
            .await
            .unwrap());
    }
}

mod cache_scenarios {
    use super::*;

    #[tokio::test]
    async fn repeated_get_stays_in_memory_without_refetch() {
        let s = stack();
        let ttl = s.cache.policy().token;
        let calls = Arc::new(std::sync::atomic::AtomicU64::new(0));

        for expected_source in [CacheSource::Miss, CacheSource::Memory] {
            let calls = calls.clone();
            let lookup = s
                .cache
                .get_or_fetch("k", &ttl, move || async move {
                    calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Ok(serde_json::json!({"v": 1}))
                })
                .await
                .unwrap();
            assert_eq!(lookup.source, expected_source);
        }
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn l1_never_exceeds_capacity() {
        let store = Arc::new(rugcache::store::InMemoryStore::new());
        let mut config = CacheConfig::default();
        config.l1_capacity = 8;
        let cache = MultiLevelCache::new(store, config);
        let ttl = TtlPair {
            store_ttl_secs: 600,
            memory_ttl_secs: 300,
        };

        for i in 0..50 {
            cache.set(&format!("k{i}"), &serde_json::json!(i), &ttl).await;
            assert!(cache.memory_stats().entries <= 8);
        }
        assert_eq!(cache.memory_stats().entries, 8);
    }

    #[tokio::test]
    async fn invalidation_twice_equals_once() {
        let s = stack();
        let token = TokenId::new(8453, "0xrug", 1).unwrap();
        let ttl = s.cache.policy().token;
        s.cache
            .set(&keys::cache_token(&token), &serde_json::json!({"v": 1}), &ttl)
            .await;

        let first = s.invalidation.invalidate(&token, ChangeKind::Ownership).await;
        let second = s.invalidation.invalidate(&token, ChangeKind::Ownership).await;
        assert_eq!(first.keys_invalidated, second.keys_invalidated);
        assert!(!s.cache.get(&keys::cache_token(&token), &ttl).await.hit);
    }

    #[tokio::test]
    async fn contract_sweep_uses_dirty_sentinel() {
        let s = stack();
        let c = contract();
        s.atomic.batch_mint(&c, vec![mint_spec(1, "0xa", vec![])]).await;

        s.invalidation.invalidate_contract(&c).await;
        assert!(s.invalidation.is_contract_dirty(&c).await);

        // The sentinel expires with the collection-page TTL; once it does the
        // sweep is complete and pages rebuild lazily.
        s.store.force_expire(&keys::contract_dirty(&c));
        assert!(!s.invalidation.is_contract_dirty(&c).await);
    }
}

mod id_scenarios {
    use super::*;

    #[test]
    fn ids_round_trip_through_display() {
        for (chain, address, number) in [
            (1u64, "0xabc", 0u64),
            (8453, "0x3d6670aC0A881Dcc742c17D687F5dfE05Af81cff", 42),
            (84532, "0xDEAD", u64::MAX),
        ] {
            let id = TokenId::new(chain, address, number).unwrap();
            let parsed: TokenId = id.to_string().parse().unwrap();
            assert_eq!(parsed, id);
            assert_eq!(parsed.chain_id(), chain);
            assert_eq!(parsed.address(), address);
            assert_eq!(parsed.token_number(), number);
        }
    }

    #[test]
    fn empty_components_fail_validation() {
        assert!(ContractId::new(1, "").is_err());
        assert!(TraitId::from_raw("", "x").is_err());
        assert!(TraitId::from_raw("palette", "   ").is_err());
    }
}

mod warming_scenarios {
    use super::*;

    #[tokio::test]
    async fn behavior_drives_warming_and_accuracy() {
        let s = stack();
        let c = contract();
        s.atomic
            .batch_mint(&c, vec![mint_spec(1, "0xa", vec![]), mint_spec(2, "0xa", vec![])])
            .await;
        let viewed = TokenId::new(8453, "0xrug", 1).unwrap();

        s.warmer
            .record_action("0xa", BehaviorEvent::view_token(&viewed))
            .await
            .unwrap();

        let report = s.warmer.warm_for_user("0xa").await.unwrap();
        assert!(report.confidence > 0.3);
        assert!(report.warmed >= 2, "warmed {} tokens", report.warmed);

        // The warmed entry serves from memory.
        let ttl = s.cache.policy().token;
        let lookup = s.cache.get(&keys::cache_token(&viewed), &ttl).await;
        assert_eq!(lookup.source, CacheSource::Memory);

        s.warmer.track_accuracy("0xa", &viewed).await.unwrap();
        let stats = s.warmer.prediction_stats("0xa").await.unwrap();
        assert_eq!(stats.accurate_predictions, 1);
    }
}

mod health_scenarios {
    use super::*;

    #[tokio::test]
    async fn dashboard_reflects_operations() {
        let store = Arc::new(rugcache::store::InMemoryStore::new());
        let cache_config = CacheConfig::default();
        let policy = cache_config.ttl.clone();
        let cache = Arc::new(MultiLevelCache::new(store.clone(), cache_config));
        let invalidation = Arc::new(SmartInvalidation::new(store.clone(), cache.clone(), &policy));
        let monitoring = Arc::new(Monitoring::new(
            store.clone(),
            cache.clone(),
            MonitoringConfig::default(),
        ));
        let atomic = AtomicOperations::new(store.clone(), invalidation, monitoring.clone());

        let c = contract();
        atomic.batch_mint(&c, vec![mint_spec(1, "0xa", vec![])]).await;
        let token = TokenId::new(8453, "0xrug", 1).unwrap();
        atomic.transfer(&token, "0xa", "0xb").await;
        // A failing call feeds the error counters.
        atomic.transfer(&token, "0xa", "0xb").await;

        let dashboard = monitoring.dashboard().await;
        assert!(!dashboard.recent_activity.is_empty());
        assert!(dashboard
            .bottlenecks
            .error_prone_operations
            .iter()
            .any(|op| op.operation == "transfer"));

        let history = atomic.operation_history(None, 10).await;
        assert_eq!(history.len(), 3);
    }
}
