use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use nrf_secure_dfu::transport_btleplug::{NrfDfuTransport, DFU_TARGET_NAME};
use nrf_secure_dfu::{
    DfuConfig, DfuDriver, DfuEvent, DfuPackage, EventKind, FirmwareImage, ModeSwitch,
};

/// Update firmware on nRF BLE Secure DFU targets
#[derive(clap::Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// BLE DFU target name
    name: String,

    /// Firmware update package path
    pkg: String,

    /// Bytes per packet write
    #[arg(long, default_value_t = 20)]
    packet_size: usize,

    /// Packets between receipt notifications (0 disables flow control)
    #[arg(long, default_value_t = 0)]
    prn: u16,

    /// Milliseconds to pause between packets and after responses
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,

    /// Re-upload from byte 0 even if the device reports partial progress
    #[arg(long)]
    force_restart: bool,

    /// Disable the retry-and-degrade policy
    #[arg(long)]
    no_smart_speed: bool,

    /// Reboot an application-mode device into the bootloader first
    #[arg(long)]
    buttonless: bool,
}

impl Args {
    fn config(&self) -> DfuConfig {
        DfuConfig {
            packet_size: self.packet_size,
            prn_interval: self.prn,
            delay: Duration::from_millis(self.delay_ms),
            force_restart: self.force_restart,
            smart_speed: !self.no_smart_speed,
            ..DfuConfig::default()
        }
    }
}

fn attach_console(driver: &mut DfuDriver<NrfDfuTransport>) {
    driver.events().subscribe(EventKind::Log, |event| {
        if let DfuEvent::Log { message } = event {
            println!("{message}");
        }
    });
    driver.events().subscribe(EventKind::Progress, |event| {
        if let DfuEvent::Progress {
            object,
            total_bytes,
            sent_bytes,
            ..
        } = event
        {
            println!("Uploaded {sent_bytes}/{total_bytes} bytes ({object})");
        }
    });
}

async fn update_image(args: &Args, target: &str, image: &FirmwareImage) -> anyhow::Result<()> {
    println!("Updating {} ({} bytes)", image.name, image.image.len());
    let transport = NrfDfuTransport::discover(target).await?;
    let mut driver = DfuDriver::with_config(transport, args.config());
    attach_console(&mut driver);
    driver.update(&image.init, &image.image).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut package = DfuPackage::from_file(&args.pkg)?;

    let mut images = Vec::new();
    if let Some(image) = package.base_image()? {
        images.push(image);
    }
    if let Some(image) = package.app_image()? {
        images.push(image);
    }
    anyhow::ensure!(!images.is_empty(), "package contains no images");

    let mut target = args.name.clone();
    if args.buttonless {
        let transport = NrfDfuTransport::discover(&target).await?;
        let mut driver = DfuDriver::new(transport);
        attach_console(&mut driver);
        if driver.set_dfu_mode().await? == ModeSwitch::Rebooting {
            // The bootloader advertises under its own name.
            target = DFU_TARGET_NAME.to_string();
        }
    }

    for (index, image) in images.iter().enumerate() {
        if index > 0 {
            // The device reboots back into the bootloader between images.
            target = DFU_TARGET_NAME.to_string();
        }
        update_image(&args, &target, image).await?;
    }

    println!("Done");
    Ok(())
}
