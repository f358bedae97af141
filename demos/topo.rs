use uvc_host::{descriptor::build_index, detect, usb::RusbTransport, Transport};

fn main() -> uvc_host::Result<()> {
    env_logger::init();

    let usb = RusbTransport::new()?;
    for info in usb.devices()? {
        let raw = match usb.config_descriptor(info.address) {
            Ok(raw) => raw,
            Err(e) => {
                eprintln!("{:04x}:{:04x}: {}", info.vendor_id, info.product_id, e);
                continue;
            }
        };
        if !detect::is_video_device(&raw) {
            continue;
        }

        println!(
            "{:04x}:{:04x} at address {}",
            info.vendor_id, info.product_id, info.address
        );
        match build_index(&raw) {
            Ok(index) => println!("{:#?}", index),
            Err(e) => {
                eprintln!("error: {}", e);
                eprintln!("(skipping device)");
            }
        }
    }

    Ok(())
}
