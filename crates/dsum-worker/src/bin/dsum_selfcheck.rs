use std::sync::Arc;

use dsum_clients::HomeAssistantClient;
use dsum_worker::config::validate_zones;
use dsum_worker::{TriggerSource, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = WorkerConfig::from_env();

    println!(
        "dsum-selfcheck: starting with zones_file={}",
        config.zones_file.display()
    );
    let zones = config.load_zones()?;
    validate_zones(&zones)?;

    let home_assistant = Arc::new(HomeAssistantClient::from_env()?);
    for zone in &zones {
        zone.layout()
            .ensure_dirs()
            .await
            .map_err(|e| anyhow::anyhow!("zone {}: snapshot dir not writable: {}", zone.bundle_key, e))?;
        let state = home_assistant
            .trigger_state(&zone.trigger_entity_id)
            .await
            .map_err(|e| anyhow::anyhow!("zone {}: {}: {}", zone.bundle_key, zone.trigger_entity_id, e))?;
        println!(
            "dsum-selfcheck: zone {} ok ({} is {})",
            zone.bundle_key, zone.trigger_entity_id, state
        );
    }

    println!("dsum-selfcheck: ok");
    Ok(())
}
