//! Office day example
//!
//! Walks one office through a morning:
//! - Registering an office with two counters
//! - Booking customers and watching live snapshots
//! - Calling, completing and a no-show re-queue

use a3s_token_queue::{
    BookingRequest, EngineConfig, EventEmitter, GeoPoint, OfficeRegistration, QueueManagerBuilder,
    QueueMetrics, TokenStatus,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    println!("=== A3S Token Queue: Office Day Example ===\n");

    let metrics = QueueMetrics::local();
    let manager = QueueManagerBuilder::new(EventEmitter::new(100))
        .with_config(EngineConfig::new().with_default_avg_service_minutes(8))
        .with_metrics(metrics.clone())
        .build()
        .await?;

    let office = manager
        .register_office(
            OfficeRegistration::new("Civic Centre", 2).with_location(GeoPoint::new(51.5074, -0.1278)),
        )
        .await?;
    println!("✓ Registered {} ({} counters)", office.name, office.counter_count);

    let mut live = manager.subscribe(&office.id);
    let watcher = tokio::spawn(async move {
        while let Some(snapshot) = live.recv().await {
            println!(
                "  ⟳ wait={} allocated={} called={}",
                snapshot.summary.wait, snapshot.summary.allocated, snapshot.summary.called
            );
        }
    });

    println!("\nBooking customers...");
    let customers = [
        ("Alice", GeoPoint::new(51.5155, -0.0922)),
        ("Bob", GeoPoint::new(51.4613, -0.3037)),
        ("Charlie", GeoPoint::new(51.5033, -0.1195)),
        ("Dana", GeoPoint::new(51.5290, -0.1255)),
        ("Eve", GeoPoint::new(51.4700, -0.4543)),
        ("Frank", GeoPoint::new(51.5007, -0.1246)),
        ("Grace", GeoPoint::new(51.5194, -0.1270)),
        ("Heidi", GeoPoint::new(51.5079, -0.0877)),
    ];
    for (i, (name, location)) in customers.into_iter().enumerate() {
        let token = manager
            .book(
                &office.id,
                BookingRequest::new(name)
                    .with_user(format!("user-{}", i + 1))
                    .with_location(location),
            )
            .await?;
        println!(
            "  → #{} {} ({:?}, travel {} min, eta {:?} min)",
            token.token_number, name, token.status, token.travel_time_minutes, token.eta_minutes
        );
    }

    println!("\nServing...");
    let first = manager.call_next(&office.id, false).await?;
    let second = manager.call_next(&office.id, false).await?;
    println!("✓ Called #{} and #{}", first.token_number, second.token_number);

    match manager.call_next(&office.id, false).await {
        Err(e) => println!("✓ Third call rejected: {}", e),
        Ok(token) => println!("✗ Unexpectedly called #{}", token.token_number),
    }

    manager.complete(&first.id).await?;
    let missing = manager.no_show(&second.id).await?;
    println!("✓ #{} completed, #{} marked {}", first.token_number, missing.token_number, missing.status);

    let back = manager.requeue(&second.id).await?;
    println!("✓ #{} re-queued at position {:?}", back.token_number, back.position);

    let snapshot = manager.snapshot(&office.id).await?;
    println!("\nQueue now:");
    for token in &snapshot.tokens {
        let marker = if token.status == TokenStatus::Allocated { "●" } else { "○" };
        println!(
            "  {} #{} {} position {:?} eta {:?} min",
            marker, token.token_number, token.customer.name, token.position, token.eta_minutes
        );
    }

    let stats = metrics.snapshot().await;
    let mut counters: Vec<_> = stats
        .counters
        .iter()
        .filter(|(name, _)| !name.contains(&office.id))
        .collect();
    counters.sort();
    println!("\nMetrics:");
    for (name, value) in counters {
        println!("  {}: {}", name, value);
    }

    drop(manager);
    watcher.abort();
    println!("\n=== Example completed ===");
    Ok(())
}
