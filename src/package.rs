//! Firmware update package reader.
//!
//! A package is a ZIP archive carrying `manifest.json` plus the init packet
//! (`.dat`) and firmware image (`.bin`) files it references.

use std::io::{Cursor, Read};
use std::path::Path;

use serde::Deserialize;

use crate::error::Error;

/// The `manifest` sub-object of `manifest.json`.
///
/// At most one of `softdevice`, `bootloader`, `softdevice_bootloader` is
/// expected; `application` is independent of all three.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    pub application: Option<ManifestEntry>,
    pub softdevice: Option<ManifestEntry>,
    pub bootloader: Option<ManifestEntry>,
    pub softdevice_bootloader: Option<ManifestEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestEntry {
    pub bin_file: String,
    pub dat_file: String,
}

/// One image set extracted from a package: the init packet authorizing the
/// transfer and the firmware bytes themselves.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    pub name: &'static str,
    pub init: Vec<u8>,
    pub image: Vec<u8>,
}

#[derive(Debug)]
pub struct DfuPackage {
    archive: zip::ZipArchive<Cursor<Vec<u8>>>,
    manifest: Manifest,
}

impl DfuPackage {
    /// Open a package from its raw archive bytes.
    pub fn open(bytes: Vec<u8>) -> Result<Self, Error> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
            .map_err(|e| Error::MalformedPackage(e.to_string()))?;

        #[derive(Deserialize)]
        struct Root {
            manifest: Manifest,
        }

        let manifest = {
            let file = archive
                .by_name("manifest.json")
                .map_err(|_| Error::MalformedPackage("manifest.json not found".into()))?;
            let root: Root = serde_json::from_reader(file)
                .map_err(|e| Error::MalformedPackage(format!("invalid manifest: {e}")))?;
            root.manifest
        };

        Ok(DfuPackage { archive, manifest })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let bytes =
            std::fs::read(path).map_err(|e| Error::MalformedPackage(e.to_string()))?;
        Self::open(bytes)
    }

    /// A copy of the manifest; mutating it does not affect later reads.
    pub fn manifest(&self) -> Manifest {
        self.manifest.clone()
    }

    /// The softdevice/bootloader image set, whichever the manifest carries.
    pub fn base_image(&mut self) -> Result<Option<FirmwareImage>, Error> {
        let candidates = [
            ("softdevice", self.manifest.softdevice.clone()),
            ("bootloader", self.manifest.bootloader.clone()),
            (
                "softdevice_bootloader",
                self.manifest.softdevice_bootloader.clone(),
            ),
        ];
        for (name, entry) in candidates {
            if let Some(entry) = entry {
                return Ok(Some(self.load(name, &entry)?));
            }
        }
        Ok(None)
    }

    /// The application image set, if present.
    pub fn app_image(&mut self) -> Result<Option<FirmwareImage>, Error> {
        match self.manifest.application.clone() {
            Some(entry) => Ok(Some(self.load("application", &entry)?)),
            None => Ok(None),
        }
    }

    fn load(&mut self, name: &'static str, entry: &ManifestEntry) -> Result<FirmwareImage, Error> {
        let init = self.read_member(&entry.dat_file)?;
        let image = self.read_member(&entry.bin_file)?;
        Ok(FirmwareImage { name, init, image })
    }

    fn read_member(&mut self, name: &str) -> Result<Vec<u8>, Error> {
        let mut file = self
            .archive
            .by_name(name)
            .map_err(|_| Error::MalformedPackage(format!("{name} not found in archive")))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .map_err(|e| Error::MalformedPackage(e.to_string()))?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use zip::write::SimpleFileOptions;

    use super::*;

    fn build_package(manifest: &str, members: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        if !manifest.is_empty() {
            writer.start_file("manifest.json", options).unwrap();
            writer.write_all(manifest.as_bytes()).unwrap();
        }
        for (name, bytes) in members {
            writer.start_file(*name, options).unwrap();
            writer.write_all(bytes).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn reads_application_image() {
        let bytes = build_package(
            r#"{"manifest": {"application": {"bin_file": "app.bin", "dat_file": "app.dat"}}}"#,
            &[("app.bin", &[1, 2, 3]), ("app.dat", &[9, 9])],
        );
        let mut pkg = DfuPackage::open(bytes).unwrap();
        assert!(pkg.base_image().unwrap().is_none());
        let app = pkg.app_image().unwrap().unwrap();
        assert_eq!(app.name, "application");
        assert_eq!(app.init, vec![9, 9]);
        assert_eq!(app.image, vec![1, 2, 3]);
    }

    #[test]
    fn base_image_prefers_softdevice() {
        let bytes = build_package(
            concat!(
                r#"{"manifest": {"#,
                r#""softdevice": {"bin_file": "sd.bin", "dat_file": "sd.dat"},"#,
                r#""bootloader": {"bin_file": "bl.bin", "dat_file": "bl.dat"}}}"#,
            ),
            &[
                ("sd.bin", &[1]),
                ("sd.dat", &[2]),
                ("bl.bin", &[3]),
                ("bl.dat", &[4]),
            ],
        );
        let mut pkg = DfuPackage::open(bytes).unwrap();
        let base = pkg.base_image().unwrap().unwrap();
        assert_eq!(base.name, "softdevice");
        assert_eq!(base.image, vec![1]);
    }

    #[test]
    fn missing_manifest_rejected() {
        let bytes = build_package("", &[("app.bin", &[1])]);
        let err = DfuPackage::open(bytes).unwrap_err();
        assert!(matches!(err, Error::MalformedPackage(_)));
        assert!(err.to_string().contains("manifest.json"));
    }

    #[test]
    fn manifest_without_manifest_key_rejected() {
        let bytes = build_package(r#"{"something": {}}"#, &[]);
        assert!(matches!(
            DfuPackage::open(bytes),
            Err(Error::MalformedPackage(_))
        ));
    }

    #[test]
    fn invalid_json_rejected() {
        let bytes = build_package("not json at all", &[]);
        assert!(matches!(
            DfuPackage::open(bytes),
            Err(Error::MalformedPackage(_))
        ));
    }

    #[test]
    fn missing_referenced_member_rejected() {
        let bytes = build_package(
            r#"{"manifest": {"application": {"bin_file": "app.bin", "dat_file": "app.dat"}}}"#,
            &[("app.dat", &[9])],
        );
        let mut pkg = DfuPackage::open(bytes).unwrap();
        let err = pkg.app_image().unwrap_err();
        assert!(err.to_string().contains("app.bin"));
    }

    #[test]
    fn unknown_manifest_fields_ignored() {
        let bytes = build_package(
            concat!(
                r#"{"manifest": {"application": {"bin_file": "a.bin", "dat_file": "a.dat","#,
                r#""dfu_version": 0.5}}}"#,
            ),
            &[("a.bin", &[1]), ("a.dat", &[2])],
        );
        let mut pkg = DfuPackage::open(bytes).unwrap();
        assert!(pkg.app_image().unwrap().is_some());
    }
}
