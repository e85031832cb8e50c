use crate::cmd::{Result, RpibootError};
use crate::RPIBOOT_VID;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// A device variant the boot ROM can identify itself as
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Model {
    pub product_id: u16,
    pub name: String,
    pub chipset: String,
    #[serde(default)]
    pub supported: bool,
    #[serde(default)]
    pub tested: bool,
    /// Directory chip specific files live under, e.g. `2712`
    #[serde(default)]
    pub fs_prefix: Option<String>,
    /// First stage file pushed to the boot ROM
    pub boot_file_name: String,
    #[serde(default)]
    pub gadget_compatibility: BTreeMap<String, bool>,
}
impl Model {
    pub fn is_compatible(&self, gadget_id: &str) -> bool {
        self.gadget_compatibility
            .get(gadget_id)
            .copied()
            .unwrap_or(false)
    }
}

/// A named set of files a device can boot into
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Gadget {
    pub id: String,
    pub name: String,
    /// Asset location of the tar archive holding the generic boot files
    pub bootfiles: String,
    /// File name as requested by the device -> asset location
    #[serde(default)]
    pub files: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    #[serde(default = "default_vendor_id")]
    pub vendor_id: u16,
    #[serde(default, rename = "model")]
    pub models: Vec<Model>,
    #[serde(default, rename = "gadget")]
    pub gadgets: Vec<Gadget>,
}

fn default_vendor_id() -> u16 {
    RPIBOOT_VID
}

fn compat(pairs: &[(&str, bool)]) -> BTreeMap<String, bool> {
    pairs.iter().map(|(id, ok)| (id.to_string(), *ok)).collect()
}

fn files(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(name, location)| (name.to_string(), location.to_string()))
        .collect()
}

impl Catalog {
    /// The models and gadgets known out of the box.
    ///
    /// Asset locations are relative to the `usbboot` checkout layout.
    pub fn builtin() -> Self {
        let none = compat(&[("mass_storage64", false), ("recover_eeprom5", false)]);

        Catalog {
            vendor_id: RPIBOOT_VID,
            models: vec![
                Model {
                    product_id: 0x2763,
                    name: "Unknown".into(),
                    chipset: "BCM2708".into(),
                    supported: false,
                    tested: false,
                    fs_prefix: None,
                    boot_file_name: "bootcode.bin".into(),
                    gadget_compatibility: none.clone(),
                },
                Model {
                    product_id: 0x2764,
                    name: "Raspberry Pi 3".into(),
                    chipset: "BCM2710".into(),
                    supported: true,
                    tested: false,
                    fs_prefix: None,
                    boot_file_name: "bootcode.bin".into(),
                    gadget_compatibility: none.clone(),
                },
                Model {
                    product_id: 0x2711,
                    name: "Raspberry Pi 4 Model B, Raspberry Pi 400, Raspberry Pi Compute Module 4"
                        .into(),
                    chipset: "BCM2711".into(),
                    supported: true,
                    tested: false,
                    fs_prefix: Some("2711".into()),
                    boot_file_name: "bootcode4.bin".into(),
                    gadget_compatibility: none,
                },
                Model {
                    product_id: 0x2712,
                    name: "Raspberry Pi 5".into(),
                    chipset: "BCM2712".into(),
                    supported: true,
                    tested: false,
                    fs_prefix: Some("2712".into()),
                    boot_file_name: "bootcode5.bin".into(),
                    gadget_compatibility: compat(&[
                        ("mass_storage64", true),
                        ("recover_eeprom5", false),
                    ]),
                },
            ],
            gadgets: vec![
                Gadget {
                    id: "mass_storage64".into(),
                    name: "Mass Storage Gadget (64 bit devices)".into(),
                    bootfiles: "firmware/bootfiles.bin".into(),
                    files: files(&[
                        ("config.txt", "mass-storage-gadget64/config.txt"),
                        ("boot.img", "mass-storage-gadget64/boot.img"),
                    ]),
                },
                Gadget {
                    id: "recover_eeprom5".into(),
                    name: "Recovery EEPROM (Raspberry Pi 5)".into(),
                    bootfiles: "firmware/bootfiles.bin".into(),
                    files: files(&[
                        ("boot.conf", "recovery5/boot.conf"),
                        ("bootcode5.bin", "firmware/2712/recovery.bin"),
                        ("pieeprom.bin", "recovery5/pieeprom.bin"),
                        (
                            "pieeprom.original.bin",
                            "rpi-eeprom/firmware-2712/default/pieeprom-2024-06-05.bin",
                        ),
                        ("pieeprom.sig", "recovery5/pieeprom.sig"),
                        ("recovery.bin", "recovery5/recovery.bin"),
                    ]),
                },
            ],
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let catalog: Catalog = toml::from_str(s)?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let s = std::fs::read_to_string(path)?;
        Self::from_toml_str(&s)
    }

    pub fn validate(&self) -> Result<()> {
        let mut gadget_ids = HashSet::new();
        for gadget in &self.gadgets {
            if !gadget_ids.insert(gadget.id.as_str()) {
                return Err(RpibootError::Config(format!(
                    "gadget {} is defined twice",
                    gadget.id
                )));
            }
        }

        let mut product_ids = HashSet::new();
        for model in &self.models {
            if !product_ids.insert(model.product_id) {
                return Err(RpibootError::Config(format!(
                    "product id {:#06x} is defined twice",
                    model.product_id
                )));
            }
            if let Some(id) = model
                .gadget_compatibility
                .keys()
                .find(|id| !gadget_ids.contains(id.as_str()))
            {
                return Err(RpibootError::Config(format!(
                    "{} lists compatibility with unknown gadget {}",
                    model.name, id
                )));
            }
        }
        Ok(())
    }

    pub fn model(&self, product_id: u16) -> Option<&Model> {
        self.models.iter().find(|m| m.product_id == product_id)
    }

    pub fn gadget(&self, id: &str) -> Option<&Gadget> {
        self.gadgets.iter().find(|g| g.id == id)
    }

    pub fn product_ids(&self) -> Vec<u16> {
        self.models.iter().map(|m| m.product_id).collect()
    }

    /// Gadgets the model can run, in catalog order.
    pub fn gadgets_for(&self, model: &Model) -> Vec<&Gadget> {
        self.gadgets
            .iter()
            .filter(|g| model.is_compatible(&g.id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CATALOG: &str = r#"
vendor_id = 0x0a5c

[[gadget]]
id = "mass_storage64"
name = "Mass Storage"
bootfiles = "bootfiles.bin"
files = { "boot.img" = "msg/boot.img" }

[[model]]
product_id = 0x2712
name = "Raspberry Pi 5"
chipset = "BCM2712"
fs_prefix = "2712"
boot_file_name = "bootcode5.bin"
gadget_compatibility = { mass_storage64 = true }

[[model]]
product_id = 0x2764
name = "Raspberry Pi 3"
chipset = "BCM2710"
boot_file_name = "bootcode.bin"
"#;

    #[test]
    fn builtin_is_valid() {
        let catalog = Catalog::builtin();
        catalog.validate().unwrap();
        assert_eq!(catalog.vendor_id, 0x0a5c);

        let pi5 = catalog.model(0x2712).unwrap();
        assert_eq!(pi5.fs_prefix.as_deref(), Some("2712"));
        let ids: Vec<_> = catalog
            .gadgets_for(pi5)
            .iter()
            .map(|g| g.id.as_str())
            .collect();
        assert_eq!(ids, ["mass_storage64"]);

        let pi3 = catalog.model(0x2764).unwrap();
        assert!(catalog.gadgets_for(pi3).is_empty());
    }

    #[test]
    fn parses_toml() {
        let catalog = Catalog::from_toml_str(CATALOG).unwrap();
        assert_eq!(catalog.product_ids(), vec![0x2712, 0x2764]);
        let gadget = catalog.gadget("mass_storage64").unwrap();
        assert_eq!(gadget.files["boot.img"], "msg/boot.img");
        assert!(catalog.model(0x2712).unwrap().is_compatible("mass_storage64"));
        assert!(!catalog.model(0x2764).unwrap().is_compatible("mass_storage64"));
    }

    #[test]
    fn rejects_unknown_gadget_reference() {
        let toml = CATALOG.replace("{ mass_storage64 = true }", "{ nope = true }");
        assert!(matches!(
            Catalog::from_toml_str(&toml),
            Err(RpibootError::Config(_))
        ));
    }

    #[test]
    fn rejects_duplicate_product_id() {
        let toml = CATALOG.replace("0x2764", "0x2712");
        assert!(matches!(
            Catalog::from_toml_str(&toml),
            Err(RpibootError::Config(_))
        ));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CATALOG.as_bytes()).unwrap();
        let catalog = Catalog::load(file.path()).unwrap();
        assert_eq!(catalog.models.len(), 2);
    }
}
