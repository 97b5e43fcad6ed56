use gated_rs::{configure, MemoryAdapter, Subject};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    // Install the process-wide evaluator once at startup
    configure(MemoryAdapter::new());

    gated_rs::create_flag("new-checkout").await?;

    let user = Subject::new("user-123").with_kind("user");
    gated_rs::grant_access("new-checkout", &user.id).await?;

    let enabled = gated_rs::is_enabled("new-checkout", &user.id).await?;
    println!("new-checkout enabled for {}: {}", user.id, enabled);

    // Bulk grants report per-subject outcomes instead of failing the batch
    let outcome = gated_rs::grant_access_bulk(
        "new-checkout",
        &["user-123".to_string(), "user-456".to_string()],
    )
    .await?;
    println!(
        "bulk grant: {} succeeded, {} failed",
        outcome.successful.len(),
        outcome.failed.len()
    );
    for failure in &outcome.failed {
        println!("  {}: {}", failure.subject_id, failure.error);
    }

    for flag in gated_rs::list_flags().await? {
        println!(
            "flag {} ({}): enabled_for_all={}",
            flag.name, flag.id, flag.enabled_for_all
        );
    }

    Ok(())
}
