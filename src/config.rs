//! Configuration inputs from the parent VMM process. This crate never
//! parses a config file or CLI argument itself; it only defines the
//! shape the caller fills in before constructing a `VmmState`.

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct NicFlags: u8 {
        /// Enables MAC-address filtering on RX and TX.
        const LOCKED = 1 << 0;
        /// Enables the local DHCP responder.
        const LOCAL = 1 << 1;
        /// The guest will PXE-boot off this interface.
        const PXEBOOT = 1 << 2;
    }
}

#[derive(Debug, Clone)]
pub struct DiskConfig {
    pub base_path: std::path::PathBuf,
    pub overlay_path: Option<std::path::PathBuf>,
    pub read_only: bool,
}

#[derive(Debug, Clone)]
pub struct NicConfig {
    pub mac: [u8; 6],
    pub tap_fd: std::os::fd::RawFd,
    pub flags: NicFlags,
}

#[derive(Debug, Clone, Default)]
pub struct VmConfig {
    pub vm_id: u32,
    pub pci_ids: Vec<u32>,
    pub disks: Vec<DiskConfig>,
    pub nics: Vec<NicConfig>,
    pub cdrom_fd: Option<std::os::fd::RawFd>,
}
