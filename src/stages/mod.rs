//! Built-in provisioning stages
//!
//! Pipeline order: hardware → network → packages → models → service →
//! integrations.

pub mod hardware;
pub mod integrations;
pub mod models;
pub mod network;
pub mod packages;
pub mod service;

use std::time::Duration;

pub use hardware::HardwareStage;
pub use integrations::IntegrationsStage;
pub use models::ModelsStage;
pub use network::NetworkStage;
pub use packages::PackagesStage;
pub use service::ServiceStage;

use crate::config::MidwifeConfig;
use crate::error::Result;
use crate::stage::{Catalog, Stage};

/// The standard catalog, configured from `config`.
pub fn standard_catalog(config: &MidwifeConfig) -> Result<Catalog> {
    let stages: Vec<Box<dyn Stage>> = vec![
        Box::new(HardwareStage::new()),
        Box::new(NetworkStage::new(&config.network)),
        Box::new(PackagesStage::new(config.packages.clone())),
        Box::new(ModelsStage::new(&config.models)),
        Box::new(ServiceStage::new(&config.service)),
        Box::new(IntegrationsStage::new(
            &config.integrations,
            Duration::from_secs(config.network.timeout_secs),
            config.network.attempts,
        )),
    ];
    Catalog::new(stages)
}
