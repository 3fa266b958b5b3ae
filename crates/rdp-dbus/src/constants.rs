/// D-Bus service name for the COSMIC RDP Server daemon.
pub const SERVICE_NAME: &str = "com.system76.CosmicRdpServer";

/// D-Bus object path for the COSMIC RDP Server daemon.
pub const OBJECT_PATH: &str = "/com/system76/CosmicRdpServer";
