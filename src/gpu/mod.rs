//! PCI passthrough driver: rebinds the primary discrete GPU between its
//! host driver and the vfio-pci stub so a guest VMM can claim it.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::command::{run_cancellable, CommandRunner};

const VFIO_NEW_ID: &str = "/sys/bus/pci/drivers/vfio-pci/new_id";
const VFIO_BIND: &str = "/sys/bus/pci/drivers/vfio-pci/bind";
const VFIO_UNBIND: &str = "/sys/bus/pci/drivers/vfio-pci/unbind";

/// Result of a successful passthrough preparation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassthroughDevice {
    pub pci_address: String,
    pub original_driver: String,
    pub vfio_device_path: String,
}

pub struct GpuDriver<'a> {
    runner: &'a dyn CommandRunner,
    cancel: &'a CancellationToken,
}

impl<'a> GpuDriver<'a> {
    pub fn new(runner: &'a dyn CommandRunner, cancel: &'a CancellationToken) -> Self {
        Self { runner, cancel }
    }

    async fn run(&self, stdin: Option<&str>, argv: &[&str]) -> Result<String> {
        run_cancellable(self.runner, self.cancel, stdin, argv).await
    }

    /// Unbind the primary GPU from its host driver and hand it to vfio-pci.
    /// Any failure after discovery returns the device to the host before
    /// surfacing the original error.
    pub async fn prepare(&self) -> Result<PassthroughDevice> {
        let (pci_address, original_driver) = self.find_primary_gpu().await?;
        info!(pci = %pci_address, driver = %original_driver, "preparing GPU for passthrough");

        if let Err(e) = self.bind_to_vfio(&pci_address).await {
            self.return_to_host(&pci_address, &original_driver).await;
            return Err(e);
        }

        let vfio_device_path = match self.wait_for_iommu_node(&pci_address).await {
            Ok(p) => p,
            Err(e) => {
                self.return_to_host(&pci_address, &original_driver).await;
                return Err(e);
            }
        };

        Ok(PassthroughDevice {
            pci_address,
            original_driver,
            vfio_device_path,
        })
    }

    /// Scan PCI for a 3D controller (0302) first, then VGA (0300), and pick
    /// the first device that has both a bus address and a bound driver.
    async fn find_primary_gpu(&self) -> Result<(String, String)> {
        for class in ["0302", "0300"] {
            let selector = format!("::{}", class);
            let output = match self.run(None, &["lspci", "-vmm", "-d", &selector]).await {
                Ok(o) if !o.is_empty() => o,
                _ => continue,
            };
            if let Some(found) = parse_lspci_vmm(&output) {
                return Ok(found);
            }
        }
        bail!("no suitable VGA/3D controller with a bound driver found")
    }

    async fn bind_to_vfio(&self, pci_address: &str) -> Result<()> {
        let full_addr = format!("0000:{}", pci_address);

        let unbind_path = format!("/sys/bus/pci/devices/{}/driver/unbind", full_addr);
        self.run(Some(&full_addr), &["tee", &unbind_path])
            .await
            .context("unbinding GPU from host driver")?;

        // Let the kernel settle before touching the stub driver.
        tokio::time::sleep(Duration::from_millis(500)).await;

        let id_line = self
            .run(None, &["lspci", "-n", "-s", pci_address])
            .await
            .context("reading vendor/device IDs")?;
        let vendor_device = parse_vendor_device(&id_line)
            .with_context(|| format!("unexpected lspci -n output: {}", id_line))?;

        if let Err(e) = self.run(Some(&vendor_device), &["tee", VFIO_NEW_ID]).await {
            // The ID pair may already be registered from a previous run.
            if !e.to_string().contains("File exists") {
                return Err(e).context("registering device ID with vfio-pci");
            }
        }

        self.run(Some(&full_addr), &["tee", VFIO_BIND])
            .await
            .context("binding GPU to vfio-pci")?;
        Ok(())
    }

    /// Resolve the device's IOMMU group to its /dev/vfio node, polling up to
    /// a second for the kernel to create it.
    async fn wait_for_iommu_node(&self, pci_address: &str) -> Result<String> {
        let link = format!("/sys/bus/pci/devices/0000:{}/iommu_group", pci_address);
        let target = self
            .run(None, &["readlink", "-f", &link])
            .await
            .with_context(|| {
                format!(
                    "cannot find IOMMU group for {}; verify IOMMU is enabled in BIOS",
                    pci_address
                )
            })?;

        let group = PathBuf::from(target.trim())
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .context("IOMMU group link has no terminal component")?;
        let node = format!("/dev/vfio/{}", group);

        for _ in 0..10 {
            if self.run(None, &["test", "-e", &node]).await.is_ok() {
                return Ok(node);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        bail!(
            "VFIO device node {} never appeared; verify IOMMU is enabled in BIOS",
            node
        )
    }

    /// Rebind the device to its original host driver. The vfio unbind and
    /// the trailing hardware reset are best-effort; a failed rebind to the
    /// original driver is surfaced.
    pub async fn return_to_host(&self, pci_address: &str, original_driver: &str) {
        let full_addr = format!("0000:{}", pci_address);

        if let Err(e) = self.run(Some(&full_addr), &["tee", VFIO_UNBIND]).await {
            warn!(pci = pci_address, error = %e, "unbind from vfio-pci failed");
        }

        let bind_path = format!("/sys/bus/pci/drivers/{}/bind", original_driver);
        if let Err(e) = self.run(Some(&full_addr), &["tee", &bind_path]).await {
            warn!(pci = pci_address, driver = original_driver, error = %e,
                "re-binding GPU to host driver failed");
            return;
        }

        if let Err(e) = self.run(None, &["nvidia-smi", "-r"]).await {
            warn!(pci = pci_address, error = %e, "GPU hardware reset failed, card state may not be clean");
        } else {
            info!(pci = pci_address, "GPU returned to host and reset");
        }
    }
}

/// Parse `lspci -vmm` output: blank-line-separated blocks of
/// `Field:\tvalue` pairs. Returns the first (slot, driver) pair where both
/// are present.
fn parse_lspci_vmm(output: &str) -> Option<(String, String)> {
    for block in output.split("\n\n") {
        let mut slot = None;
        let mut driver = None;
        for line in block.lines() {
            if let Some(rest) = line.strip_prefix("Slot:") {
                slot = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("Driver:") {
                driver = Some(rest.trim().to_string());
            }
        }
        if let (Some(s), Some(d)) = (slot, driver) {
            if !s.is_empty() && !d.is_empty() {
                return Some((s, d));
            }
        }
    }
    None
}

/// Parse `lspci -n -s <addr>` ("01:00.0 0302: 10de:2204 (rev a1)") into the
/// space-separated vendor/device pair vfio-pci's new_id file expects.
fn parse_vendor_device(line: &str) -> Option<String> {
    let ids = line.split_whitespace().nth(2)?;
    let (vendor, device) = ids.split_once(':')?;
    Some(format!("{} {}", vendor, device))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lspci_vmm_picks_first_complete_block() {
        let output = "Slot:\t00:02.0\nClass:\tVGA compatible controller\n\n\
                      Slot:\t01:00.0\nClass:\t3D controller\nDriver:\tnvidia\n";
        assert_eq!(
            parse_lspci_vmm(output),
            Some(("01:00.0".to_string(), "nvidia".to_string()))
        );
    }

    #[test]
    fn test_parse_lspci_vmm_no_driver() {
        let output = "Slot:\t01:00.0\nClass:\t3D controller\n";
        assert_eq!(parse_lspci_vmm(output), None);
    }

    #[test]
    fn test_parse_vendor_device() {
        assert_eq!(
            parse_vendor_device("01:00.0 0302: 10de:2204 (rev a1)"),
            Some("10de 2204".to_string())
        );
        assert_eq!(parse_vendor_device("garbage"), None);
    }

    mod driver {
        use super::*;
        use crate::command::CommandRunner;
        use std::sync::Mutex;

        struct FakePci {
            calls: Mutex<Vec<(Option<String>, String)>>,
            fail_bind: bool,
        }

        #[async_trait::async_trait]
        impl CommandRunner for FakePci {
            async fn run(&self, stdin: Option<&str>, argv: &[&str]) -> Result<String> {
                let joined = argv.join(" ");
                self.calls
                    .lock()
                    .unwrap()
                    .push((stdin.map(String::from), joined.clone()));

                if joined.starts_with("lspci -vmm -d ::0302") {
                    return Ok("Slot:\t01:00.0\nClass:\t3D controller\nDriver:\tnvidia\n".into());
                }
                if joined.starts_with("lspci -n -s") {
                    return Ok("01:00.0 0302: 10de:2204".into());
                }
                if joined.starts_with("readlink") {
                    return Ok("/sys/kernel/iommu_groups/42".into());
                }
                if joined.contains("vfio-pci/bind") && self.fail_bind {
                    anyhow::bail!("command '{}' failed: exit status: 1; stderr: No such device", joined);
                }
                Ok(String::new())
            }
        }

        #[tokio::test]
        async fn test_prepare_round_trip_metadata() {
            let runner = FakePci {
                calls: Mutex::new(Vec::new()),
                fail_bind: false,
            };
            let cancel = CancellationToken::new();
            let driver = GpuDriver::new(&runner, &cancel);

            let device = driver.prepare().await.unwrap();
            assert_eq!(device.pci_address, "01:00.0");
            assert_eq!(device.original_driver, "nvidia");
            assert_eq!(device.vfio_device_path, "/dev/vfio/42");
        }

        #[tokio::test]
        async fn test_failed_bind_returns_gpu_to_host() {
            let runner = FakePci {
                calls: Mutex::new(Vec::new()),
                fail_bind: true,
            };
            let cancel = CancellationToken::new();
            let driver = GpuDriver::new(&runner, &cancel);

            let err = driver.prepare().await.unwrap_err();
            assert!(format!("{:#}", err).contains("binding GPU to vfio-pci"));

            let calls = runner.calls.lock().unwrap();
            // The compensation rebound the device to the recorded driver.
            let rebind = calls
                .iter()
                .find(|(_, c)| c.contains("/sys/bus/pci/drivers/nvidia/bind"))
                .expect("no rebind to original driver");
            assert_eq!(rebind.0.as_deref(), Some("0000:01:00.0"));
        }

        #[tokio::test]
        async fn test_unbind_targets_device_driver_file() {
            let runner = FakePci {
                calls: Mutex::new(Vec::new()),
                fail_bind: true,
            };
            let cancel = CancellationToken::new();
            let driver = GpuDriver::new(&runner, &cancel);
            let _ = driver.prepare().await;

            let calls = runner.calls.lock().unwrap();
            assert!(calls.iter().any(|(stdin, c)| {
                c.contains("/sys/bus/pci/devices/0000:01:00.0/driver/unbind")
                    && stdin.as_deref() == Some("0000:01:00.0")
            }));
            // The vendor/device pair was registered with the stub.
            assert!(calls
                .iter()
                .any(|(stdin, c)| c.contains("new_id") && stdin.as_deref() == Some("10de 2204")));
        }
    }
}
