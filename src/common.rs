pub mod services {
    use btleplug::api::bleuuid::uuid_from_u16;
    use uuid::Uuid;

    /// Service the session looks for unless configured otherwise.
    pub const TARGET_SERVICE: Uuid = uuid_from_u16(0xabcd);
}

pub mod characteristics {
    use btleplug::api::bleuuid::uuid_from_u16;
    use uuid::Uuid;

    /// Characteristic the session writes to unless configured otherwise.
    pub const TARGET_CHARACTERISTIC: Uuid = uuid_from_u16(0x1234);
}

pub mod descriptors {
    use btleplug::api::bleuuid::uuid_from_u16;
    use uuid::Uuid;

    pub const CLIENT_CHARACTERISTIC_CONFIGURATION: Uuid = uuid_from_u16(0x2902);

    /// Client characteristic configuration value that turns notifications on.
    pub const ENABLE_NOTIFICATION: [u8; 2] = [0x01, 0x00];
}
