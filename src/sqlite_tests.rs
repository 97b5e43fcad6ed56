#[cfg(test)]
mod sqlite_tests {
    use crate::store::{SqliteAdapter, StorageAdapter};
    use crate::{FlagError, FlagEvaluator};

    fn ids(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_unknown_flag_is_disabled() {
        let adapter = SqliteAdapter::in_memory().unwrap();

        assert!(!adapter.is_enabled("missing", "user-1").await.unwrap());
        assert!(adapter.get_flag("missing").await.unwrap().is_none());
        assert!(adapter.list_flags().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_and_fetch_flag() {
        let adapter = SqliteAdapter::in_memory().unwrap();

        let flag = adapter.create_flag("new-checkout").await.unwrap();
        assert!(!flag.enabled_for_all);

        let fetched = adapter.get_flag("new-checkout").await.unwrap().unwrap();
        assert_eq!(fetched.id, flag.id);
        assert_eq!(fetched.name, "new-checkout");
        assert_eq!(fetched.created_at, fetched.updated_at);

        match adapter.create_flag("new-checkout").await {
            Err(FlagError::Conflict(name)) => assert_eq!(name, "new-checkout"),
            other => panic!("expected Conflict, got {:?}", other.map(|f| f.name)),
        }
    }

    #[tokio::test]
    async fn test_grant_revoke_round_trip() {
        let adapter = SqliteAdapter::in_memory().unwrap();
        adapter.create_flag("beta").await.unwrap();

        adapter.grant_access("beta", "user-1").await.unwrap();
        assert!(adapter.is_enabled("beta", "user-1").await.unwrap());
        assert!(!adapter.is_enabled("beta", "user-2").await.unwrap());

        adapter.grant_access("beta", "user-1").await.unwrap();
        assert!(adapter.is_enabled("beta", "user-1").await.unwrap());

        // Revoking keeps the row but disables it.
        adapter.revoke_access("beta", "user-1").await.unwrap();
        assert!(!adapter.is_enabled("beta", "user-1").await.unwrap());

        // Re-granting flips the same row back on.
        adapter.grant_access("beta", "user-1").await.unwrap();
        assert!(adapter.is_enabled("beta", "user-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_bulk_grant_treats_disabled_row_as_no_access() {
        let adapter = SqliteAdapter::in_memory().unwrap();
        adapter.create_flag("beta").await.unwrap();
        adapter.grant_access("beta", "s1").await.unwrap();
        adapter.grant_access("beta", "s2").await.unwrap();
        adapter.revoke_access("beta", "s2").await.unwrap();

        // s1 holds an enabled grant; s2's row is soft-disabled, so
        // re-granting it succeeds; s3 is new.
        let result = adapter
            .grant_access_bulk("beta", &ids(&["s1", "s2", "s3"]))
            .await
            .unwrap();
        assert_eq!(result.successful, ids(&["s2", "s3"]));
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].subject_id, "s1");
        assert_eq!(result.failed[0].error, "subject already has access");

        assert!(adapter.is_enabled("beta", "s2").await.unwrap());
        assert!(adapter.is_enabled("beta", "s3").await.unwrap());
    }

    #[tokio::test]
    async fn test_bulk_revoke_partitions_outcomes() {
        let adapter = SqliteAdapter::in_memory().unwrap();
        adapter.create_flag("beta").await.unwrap();
        adapter.grant_access("beta", "s1").await.unwrap();

        let result = adapter
            .revoke_access_bulk("beta", &ids(&["s1", "s2"]))
            .await
            .unwrap();
        assert_eq!(result.successful, ids(&["s1"]));
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].error, "subject does not have access");

        // A second bulk revoke of the now-disabled row also fails.
        let result = adapter
            .revoke_access_bulk("beta", &ids(&["s1"]))
            .await
            .unwrap();
        assert!(result.successful.is_empty());
        assert_eq!(result.failed.len(), 1);
    }

    #[tokio::test]
    async fn test_bulk_missing_flag_fails() {
        let adapter = SqliteAdapter::in_memory().unwrap();

        assert!(matches!(
            adapter.grant_access_bulk("ghost", &ids(&["s1"])).await,
            Err(FlagError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_enable_for_all_and_reset() {
        let adapter = SqliteAdapter::in_memory().unwrap();
        adapter.create_flag("rollout").await.unwrap();
        adapter.grant_access("rollout", "user-1").await.unwrap();

        adapter.enable_for_all("rollout").await.unwrap();
        assert!(adapter.is_enabled("rollout", "user-2").await.unwrap());

        // disable_for_all deletes the grant rows outright.
        adapter.disable_for_all("rollout").await.unwrap();
        assert!(!adapter.is_enabled("rollout", "user-1").await.unwrap());
        assert!(!adapter.is_enabled("rollout", "user-2").await.unwrap());

        // With the rows gone, a bulk grant of the old holder succeeds.
        let result = adapter
            .grant_access_bulk("rollout", &ids(&["user-1"]))
            .await
            .unwrap();
        assert_eq!(result.successful, ids(&["user-1"]));
    }

    #[tokio::test]
    async fn test_delete_flag_cascades_to_grants() {
        let adapter = SqliteAdapter::in_memory().unwrap();
        adapter.create_flag("temp").await.unwrap();
        adapter.grant_access("temp", "user-1").await.unwrap();

        adapter.delete_flag("temp").await.unwrap();
        assert!(adapter.get_flag("temp").await.unwrap().is_none());
        assert!(!adapter.is_enabled("temp", "user-1").await.unwrap());

        // The foreign key cascade removed the grant rows, so a recreated
        // flag starts clean.
        adapter.create_flag("temp").await.unwrap();
        assert!(!adapter.is_enabled("temp", "user-1").await.unwrap());

        assert!(matches!(
            adapter.delete_flag("ghost").await,
            Err(FlagError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_get_active_flags() {
        let adapter = SqliteAdapter::in_memory().unwrap();
        adapter.create_flag("flag-a").await.unwrap();
        adapter.create_flag("flag-b").await.unwrap();
        adapter.create_flag("flag-c").await.unwrap();
        adapter.grant_access("flag-a", "user-1").await.unwrap();
        adapter.grant_access("flag-b", "user-1").await.unwrap();
        adapter.revoke_access("flag-b", "user-1").await.unwrap();
        adapter.enable_for_all("flag-c").await.unwrap();

        let mut active: Vec<String> = adapter
            .get_active_flags("user-1")
            .await
            .unwrap()
            .into_iter()
            .map(|flag| flag.name)
            .collect();
        active.sort();
        // flag-b's grant is disabled, so it does not count as active.
        assert_eq!(active, ids(&["flag-a", "flag-c"]));
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flags.db");

        {
            let adapter = SqliteAdapter::new(&path).unwrap();
            adapter.create_flag("persisted").await.unwrap();
            adapter.grant_access("persisted", "user-1").await.unwrap();
        }

        let adapter = SqliteAdapter::new(&path).unwrap();
        assert!(adapter.is_enabled("persisted", "user-1").await.unwrap());
        assert!(!adapter.is_enabled("persisted", "user-2").await.unwrap());
    }

    #[tokio::test]
    async fn test_evaluator_over_sqlite() {
        let evaluator = FlagEvaluator::new(SqliteAdapter::in_memory().unwrap());
        evaluator.create_flag("flag-a").await.unwrap();
        evaluator.create_flag("flag-b").await.unwrap();
        evaluator.grant_access("flag-a", "user-123").await.unwrap();

        let results = evaluator
            .evaluate_batch(&ids(&["flag-a", "flag-b"]), "user-123")
            .await
            .unwrap();
        assert!(results["flag-a"]);
        assert!(!results["flag-b"]);
    }
}
