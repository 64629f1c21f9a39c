//! Plugins shipped with the node
//!
//! Each one is enabled by a directory of the same name under the plugin
//! root holding a `config.json` with `"enabled": true`.

mod beacon;
mod example;
mod message_log;

pub use beacon::BeaconPlugin;
pub use example::ExamplePlugin;
pub use message_log::MessageLogPlugin;

use meshbridge_core::PluginCatalog;

/// Every bundled plugin, by directory name
pub fn catalog() -> PluginCatalog {
    PluginCatalog::new()
        .with(example::ID, ExamplePlugin::default)
        .with(message_log::ID, MessageLogPlugin::default)
        .with(beacon::ID, BeaconPlugin::default)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_ids() {
        assert_eq!(catalog().ids(), vec!["beacon", "example", "message_log"]);
    }
}
