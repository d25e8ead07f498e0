//! Device selection and port checks.

use std::sync::Arc;

use netbench_transport::TransportError;
use netbench_verbs::{LinkLayer, Mtu, PortAttr, Verbs};

use crate::config::RcConfig;

/// The port every connection of a transport is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivePort {
    /// Device name (e.g., "mlx5_0").
    pub device: String,
    pub port_num: u8,
    /// Local ID sent to peers during the exchange.
    pub lid: u16,
    pub active_mtu: Mtu,
    pub link_layer: LinkLayer,
}

impl ActivePort {
    /// Path MTU to program on RTR: the configured value, capped by the port.
    pub fn path_mtu(&self, config: &RcConfig) -> Mtu {
        config.path_mtu.min(self.active_mtu)
    }
}

/// Pick the device named by `config.device_index`.
pub fn select_device<V: Verbs>(
    devices: &[Arc<V>],
    config: &RcConfig,
) -> Result<Arc<V>, TransportError> {
    devices
        .get(config.device_index)
        .cloned()
        .ok_or_else(|| {
            TransportError::Device(format!(
                "device index {} out of range ({} available)",
                config.device_index,
                devices.len()
            ))
        })
}

/// Query the configured port of `device` and require it to be active.
pub fn open_port<V: Verbs + ?Sized>(
    device: &V,
    config: &RcConfig,
) -> Result<ActivePort, TransportError> {
    let attr: PortAttr = device
        .query_port(config.port_num)
        .map_err(|e| TransportError::Device(format!("{}: {e}", device.name())))?;
    if !attr.is_active() {
        return Err(TransportError::Device(format!(
            "{} port {} is {}",
            device.name(),
            config.port_num,
            attr.state
        )));
    }
    let port = ActivePort {
        device: device.name().to_string(),
        port_num: config.port_num,
        lid: attr.lid,
        active_mtu: attr.active_mtu,
        link_layer: attr.link_layer,
    };
    tracing::info!(
        device = %port.device,
        port = port.port_num,
        lid = port.lid,
        link_layer = %port.link_layer,
        mtu = port.active_mtu.bytes(),
        "opened RDMA port"
    );
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use netbench_verbs::{PortState, SoftFabric};

    #[test]
    fn test_open_active_port() {
        let fabric = SoftFabric::new();
        let dev = fabric.open_device("soft_0");
        let port = open_port(&dev, &RcConfig::default()).unwrap();
        assert_eq!(port.device, "soft_0");
        assert_eq!(port.lid, dev.lid());
        assert_eq!(port.link_layer, LinkLayer::Infiniband);
    }

    #[test]
    fn test_inactive_port_rejected() {
        let fabric = SoftFabric::new();
        let dev = fabric.open_device("soft_0");
        dev.set_port_state(PortState::Down);
        let err = open_port(&dev, &RcConfig::default()).unwrap_err();
        assert!(err.to_string().contains("DOWN"), "{err}");
    }

    #[test]
    fn test_missing_port_rejected() {
        let fabric = SoftFabric::new();
        let dev = fabric.open_device("soft_0");
        let config = RcConfig {
            port_num: 2,
            ..RcConfig::default()
        };
        assert!(matches!(
            open_port(&dev, &config),
            Err(TransportError::Device(_))
        ));
    }

    #[test]
    fn test_path_mtu_capped_by_port() {
        let port = ActivePort {
            device: "soft_0".into(),
            port_num: 1,
            lid: 1,
            active_mtu: Mtu::Mtu2048,
            link_layer: LinkLayer::Ethernet,
        };
        let mut config = RcConfig::default();
        assert_eq!(port.path_mtu(&config), Mtu::Mtu1024);
        config.path_mtu = Mtu::Mtu4096;
        assert_eq!(port.path_mtu(&config), Mtu::Mtu2048);
    }

    #[test]
    fn test_select_device() {
        let fabric = SoftFabric::new();
        let devices = vec![
            Arc::new(fabric.open_device("soft_0")),
            Arc::new(fabric.open_device("soft_1")),
        ];
        let config = RcConfig {
            device_index: 1,
            ..RcConfig::default()
        };
        assert_eq!(select_device(&devices, &config).unwrap().name(), "soft_1");
        let config = RcConfig {
            device_index: 2,
            ..RcConfig::default()
        };
        assert!(select_device(&devices, &config).is_err());
    }
}
