//! Cheap checks on a raw configuration descriptor, done before building a full index.

use zerocopy::FromBytes;

use crate::util::split_descriptors;

const DESC_TYPE_INTERFACE: u8 = 0x04;
const UVC_INTERF_CLASS: u8 = 0x0E;
const SC_VIDEOCONTROL: u8 = 0x01;

#[derive(Debug, FromBytes)]
#[repr(C)]
#[allow(non_snake_case)]
struct InterfaceDescriptor {
    bLength: u8,
    bDescriptorType: u8,
    bInterfaceNumber: u8,
    bAlternateSetting: u8,
    bNumEndpoints: u8,
    bInterfaceClass: u8,
    bInterfaceSubClass: u8,
}

/// Returns whether any interface of the configuration belongs to the Video class.
///
/// Descriptors after a malformed one are not looked at.
pub fn is_video_device(config: &[u8]) -> bool {
    split_descriptors(config)
        .map_while(Result::ok)
        .filter(|(_, ty, _)| *ty == DESC_TYPE_INTERFACE)
        .filter_map(|(_, _, data)| InterfaceDescriptor::read_from_prefix(data))
        .any(|desc| {
            log::trace!(
                "interface {} alt {}: class {:#04x}",
                desc.bInterfaceNumber,
                desc.bAlternateSetting,
                desc.bInterfaceClass
            );
            desc.bInterfaceClass == UVC_INTERF_CLASS
        })
}

/// Counts the video functions of a configuration, i.e. its Video Control interfaces.
pub fn video_function_count(config: &[u8]) -> usize {
    split_descriptors(config)
        .map_while(Result::ok)
        .filter(|(_, ty, _)| *ty == DESC_TYPE_INTERFACE)
        .filter_map(|(_, _, data)| InterfaceDescriptor::read_from_prefix(data))
        .filter(|desc| {
            desc.bInterfaceClass == UVC_INTERF_CLASS
                && desc.bInterfaceSubClass == SC_VIDEOCONTROL
                && desc.bAlternateSetting == 0
        })
        .count()
}
