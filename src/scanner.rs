use crate::{DiscoveredDevice, Error, ScanConfig, Transport};

/// Scans for the configured window.
///
/// Devices come back in discovery order with their latest signal strength.
/// Failing to use the adapter at all is [`Error::RadioUnavailable`].
pub async fn scan<T: Transport>(
    transport: &T,
    config: &ScanConfig,
) -> Result<Vec<DiscoveredDevice>, Error> {
    log::info!("Starting scanner for {:?}.", config.get_duration());

    let devices = transport
        .scan(config.get_duration())
        .await
        .map_err(Error::RadioUnavailable)?;

    log::info!("Scan finished. Found {} devices.", devices.len());
    for device in &devices {
        log::debug!(
            "{} ({:?} address) {} dBm {:?}",
            device.address,
            device.address_type,
            device.rssi,
            device.advertised
        );
    }

    Ok(devices)
}

/// Devices worth connecting to, in scan order.
pub fn candidates<'a>(
    devices: &'a [DiscoveredDevice],
    config: &'a ScanConfig,
) -> impl Iterator<Item = &'a DiscoveredDevice> + 'a {
    devices.iter().filter(move |device| {
        let accepted = config.accepts(device);
        if !accepted {
            log::debug!("Skipping {} ({} dBm).", device.address, device.rssi);
        }
        accepted
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockPeripheral, MockTransport};
    use crate::TransportError;
    use btleplug::api::{AddressType, BDAddr};
    use std::time::Duration;
    use tokio::time::Instant;

    fn device(last: u8, rssi: i16) -> DiscoveredDevice {
        DiscoveredDevice::new(BDAddr::from([0, 0, 0, 0, 0, last]), AddressType::Public, rssi)
    }

    #[tokio::test(start_paused = true)]
    async fn scan_lasts_the_configured_window() {
        let transport = MockTransport::new()
            .with_peripheral(MockPeripheral::new(device(1, -60)))
            .with_peripheral(MockPeripheral::new(device(2, -90)));
        let config = ScanConfig::default().duration(Duration::from_secs(3));

        let started = Instant::now();
        let devices = scan(&transport, &config).await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(devices, vec![device(1, -60), device(2, -90)]);
    }

    #[tokio::test]
    async fn unusable_adapter_is_radio_unavailable() {
        let transport = MockTransport::new().failing_scan(TransportError::NoAdapter(1));

        let result = scan(&transport, &ScanConfig::default()).await;

        assert!(matches!(
            result,
            Err(Error::RadioUnavailable(TransportError::NoAdapter(1)))
        ));
    }

    #[test]
    fn weak_devices_are_never_candidates() {
        let devices = vec![device(1, -80), device(2, -60), device(3, -71), device(4, -70)];
        let config = ScanConfig::default().minimum_rssi(-70);

        let picked = candidates(&devices, &config)
            .map(|device| device.rssi)
            .collect::<Vec<_>>();

        assert_eq!(picked, vec![-60, -70]);
    }
}
