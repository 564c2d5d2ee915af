//! USB mass-storage gadget control via configfs.
//!
//! Each slot owns a disjoint gadget tree keyed by its name,
//! `<configfs>/usb_gadget/mass-storage-<slot>`, and must never touch another
//! slot's tree. The operations are synchronous; the state machine only calls
//! `remove` in transitions that know a gadget is configured.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tracing::{debug, warn};

use crate::nbd::NbdDevice;

const VENDOR_ID: &str = "0x1d6b";
const PRODUCT_ID: &str = "0x0104";
const LANG_US_EN: &str = "0x409";

pub trait GadgetController: Send + Sync {
    /// Expose `device` to the host as a mass-storage gadget for `slot`.
    fn configure(&self, slot: &str, device: &NbdDevice, rw: bool) -> Result<()>;
    /// Tear the slot's gadget down again.
    fn remove(&self, slot: &str, device: &NbdDevice) -> Result<()>;
}

pub struct ConfigfsGadget {
    configfs_root: PathBuf,
    udc_class: PathBuf,
}

impl ConfigfsGadget {
    pub fn new() -> Self {
        Self {
            configfs_root: PathBuf::from("/sys/kernel/config/usb_gadget"),
            udc_class: PathBuf::from("/sys/class/udc"),
        }
    }

    /// Test hook: relocate the configfs and UDC roots.
    pub fn with_roots(configfs_root: impl Into<PathBuf>, udc_class: impl Into<PathBuf>) -> Self {
        Self {
            configfs_root: configfs_root.into(),
            udc_class: udc_class.into(),
        }
    }

    fn gadget_dir(&self, slot: &str) -> PathBuf {
        self.configfs_root.join(format!("mass-storage-{slot}"))
    }

    fn first_udc(&self) -> Result<String> {
        let mut entries = fs::read_dir(&self.udc_class)
            .with_context(|| format!("enumerate {}", self.udc_class.display()))?;
        let entry = entries
            .next()
            .ok_or_else(|| anyhow!("no UDC available"))?
            .context("read UDC entry")?;
        entry
            .file_name()
            .into_string()
            .map_err(|name| anyhow!("UDC name not UTF-8: {name:?}"))
    }
}

impl Default for ConfigfsGadget {
    fn default() -> Self {
        Self::new()
    }
}

fn write_attr(path: &Path, value: &str) -> Result<()> {
    fs::write(path, value).with_context(|| format!("write {}", path.display()))
}

impl GadgetController for ConfigfsGadget {
    fn configure(&self, slot: &str, device: &NbdDevice, rw: bool) -> Result<()> {
        let root = self.gadget_dir(slot);
        debug!(slot, device = %device, rw, dir = %root.display(), "configuring gadget");

        let strings = root.join("strings").join(LANG_US_EN);
        fs::create_dir_all(&strings).with_context(|| format!("create {}", strings.display()))?;
        write_attr(&root.join("idVendor"), VENDOR_ID)?;
        write_attr(&root.join("idProduct"), PRODUCT_ID)?;
        write_attr(&strings.join("manufacturer"), "OpenBMC")?;
        write_attr(&strings.join("product"), "Virtual Media Device")?;
        write_attr(&strings.join("serialnumber"), slot)?;

        let config_strings = root.join("configs/c.1/strings").join(LANG_US_EN);
        fs::create_dir_all(&config_strings)
            .with_context(|| format!("create {}", config_strings.display()))?;
        write_attr(&config_strings.join("configuration"), "config 1")?;

        let function = root.join("functions/mass_storage.usb0");
        fs::create_dir_all(&function)
            .with_context(|| format!("create {}", function.display()))?;
        let lun = function.join("lun.0");
        write_attr(&lun.join("removable"), "1")?;
        write_attr(&lun.join("cdrom"), "0")?;
        write_attr(&lun.join("ro"), if rw { "0" } else { "1" })?;
        write_attr(&lun.join("file"), &device.path().display().to_string())?;

        let link = root.join("configs/c.1/mass_storage.usb0");
        std::os::unix::fs::symlink(&function, &link)
            .with_context(|| format!("link {}", link.display()))?;

        let udc = self.first_udc()?;
        write_attr(&root.join("UDC"), &udc)?;
        Ok(())
    }

    fn remove(&self, slot: &str, device: &NbdDevice) -> Result<()> {
        let root = self.gadget_dir(slot);
        debug!(slot, device = %device, dir = %root.display(), "removing gadget");

        write_attr(&root.join("UDC"), "\n")?;
        let link = root.join("configs/c.1/mass_storage.usb0");
        fs::remove_file(&link).with_context(|| format!("unlink {}", link.display()))?;
        for dir in [
            root.join("configs/c.1/strings").join(LANG_US_EN),
            root.join("configs/c.1"),
            root.join("functions/mass_storage.usb0"),
            root.join("strings").join(LANG_US_EN),
            root.clone(),
        ] {
            if let Err(err) = fs::remove_dir(&dir) {
                // configfs refuses rmdir while the tree is referenced; report
                // the first failure so the caller can surface busy.
                warn!(dir = %dir.display(), error = %err, "gadget teardown failed");
                return Err(err).with_context(|| format!("remove {}", dir.display()));
            }
        }
        Ok(())
    }
}
