//! Thin FFI layer over the macOS facilities the switcher needs: machine model
//! lookup, the two ambient light sensor interfaces, the SkyLight appearance
//! calls and the clamshell state. Every entry point has a non-macOS fallback
//! so the rest of the crate builds and tests everywhere.

use anyhow::Result;

#[cfg(target_os = "macos")]
use anyhow::{anyhow, bail, Context};
#[cfg(target_os = "macos")]
use std::ffi::{c_char, c_int, c_void, CStr};

#[cfg(target_os = "macos")]
use mach::{
    kern_return::{kern_return_t, KERN_SUCCESS},
    port::{mach_port_t, MACH_PORT_NULL},
    traps::mach_task_self,
};

#[cfg(target_os = "macos")]
type CFTypeRef = *const c_void;
#[cfg(target_os = "macos")]
type CFIndex = isize;

#[cfg(target_os = "macos")]
#[repr(C)]
struct CFDictionaryCallBacks {
    _private: [u8; 0],
}

#[cfg(target_os = "macos")]
const K_CF_STRING_ENCODING_UTF8: u32 = 0x0800_0100;
#[cfg(target_os = "macos")]
const K_CF_NUMBER_SINT32_TYPE: CFIndex = 3;

/// `kIOHIDEventTypeAmbientLightSensor`
#[cfg(target_os = "macos")]
const HID_EVENT_TYPE_AMBIENT_LIGHT: i64 = 12;
/// `IOHIDEventFieldBase(kIOHIDEventTypeAmbientLightSensor)`
#[cfg(target_os = "macos")]
const HID_AMBIENT_LIGHT_LEVEL_FIELD: i32 = (HID_EVENT_TYPE_AMBIENT_LIGHT as i32) << 16;
#[cfg(target_os = "macos")]
const HID_ALS_USAGE_PAGE: i32 = 0xff00;
#[cfg(target_os = "macos")]
const HID_ALS_USAGE: i32 = 4;

#[cfg(target_os = "macos")]
const LMU_SERVICE_NAME: &CStr = c"AppleLMUController";
#[cfg(target_os = "macos")]
const LMU_READ_SELECTOR: u32 = 0;

#[cfg(target_os = "macos")]
#[allow(non_upper_case_globals)]
extern "C" {
    static kCFAllocatorDefault: CFTypeRef;
    static kCFTypeDictionaryKeyCallBacks: CFDictionaryCallBacks;
    static kCFTypeDictionaryValueCallBacks: CFDictionaryCallBacks;

    fn CFStringCreateWithCString(alloc: CFTypeRef, c_str: *const c_char, encoding: u32)
        -> CFTypeRef;
    fn CFNumberCreate(alloc: CFTypeRef, the_type: CFIndex, value_ptr: *const c_void) -> CFTypeRef;
    fn CFDictionaryCreate(
        alloc: CFTypeRef,
        keys: *const CFTypeRef,
        values: *const CFTypeRef,
        num_values: CFIndex,
        key_callbacks: *const CFDictionaryCallBacks,
        value_callbacks: *const CFDictionaryCallBacks,
    ) -> CFTypeRef;
    fn CFArrayGetCount(array: CFTypeRef) -> CFIndex;
    fn CFArrayGetValueAtIndex(array: CFTypeRef, index: CFIndex) -> CFTypeRef;
    fn CFRelease(cf: CFTypeRef);

    fn IOServiceMatching(name: *const c_char) -> CFTypeRef;
    fn IOServiceGetMatchingService(main_port: mach_port_t, matching: CFTypeRef) -> mach_port_t;
    fn IOServiceOpen(
        service: mach_port_t,
        owning_task: mach_port_t,
        connect_type: u32,
        connect: *mut mach_port_t,
    ) -> kern_return_t;
    fn IOServiceClose(connect: mach_port_t) -> kern_return_t;
    fn IOObjectRelease(object: mach_port_t) -> kern_return_t;
    fn IOConnectCallMethod(
        connection: mach_port_t,
        selector: u32,
        input: *const u64,
        input_count: u32,
        input_struct: *const c_void,
        input_struct_count: usize,
        output: *mut u64,
        output_count: *mut u32,
        output_struct: *mut c_void,
        output_struct_count: *mut usize,
    ) -> kern_return_t;

    fn IOHIDEventSystemClientCreate(allocator: CFTypeRef) -> CFTypeRef;
    fn IOHIDEventSystemClientSetMatching(client: CFTypeRef, matching: CFTypeRef) -> c_int;
    fn IOHIDEventSystemClientCopyServices(client: CFTypeRef) -> CFTypeRef;
    fn IOHIDServiceClientCopyEvent(
        service: CFTypeRef,
        event_type: i64,
        options: i32,
        timestamp: i64,
    ) -> CFTypeRef;
    fn IOHIDEventGetFloatValue(event: CFTypeRef, field: i32) -> f64;

    fn SLSGetAppearanceThemeLegacy() -> c_int;
    fn SLSSetAppearanceThemeLegacy(theme: c_int);

    fn sysctlbyname(
        name: *const c_char,
        oldp: *mut c_void,
        oldlenp: *mut usize,
        newp: *mut c_void,
        newlen: usize,
    ) -> c_int;
}

/// Model identifier of this machine (e.g. `MacBookPro16,1`), read from `hw.model`.
#[cfg(target_os = "macos")]
pub fn machine_model() -> Option<String> {
    let name = c"hw.model";
    unsafe {
        let mut len: usize = 0;
        if sysctlbyname(name.as_ptr(), std::ptr::null_mut(), &mut len, std::ptr::null_mut(), 0) != 0
            || len == 0
        {
            return None;
        }

        let mut buffer = vec![0u8; len];
        if sysctlbyname(
            name.as_ptr(),
            buffer.as_mut_ptr() as *mut c_void,
            &mut len,
            std::ptr::null_mut(),
            0,
        ) != 0
        {
            return None;
        }

        CStr::from_bytes_until_nul(&buffer)
            .ok()
            .and_then(|model| model.to_str().ok())
            .map(str::to_owned)
            .filter(|model| !model.is_empty())
    }
}

#[cfg(not(target_os = "macos"))]
pub fn machine_model() -> Option<String> {
    None
}

/// Raw SkyLight appearance code: `0` is light, `1` is dark.
#[cfg(target_os = "macos")]
pub fn appearance_code() -> i32 {
    unsafe { SLSGetAppearanceThemeLegacy() }
}

#[cfg(target_os = "macos")]
pub fn set_appearance_code(code: i32) {
    unsafe {
        SLSSetAppearanceThemeLegacy(code);
    }
}

/// Whether the built-in display lid is closed. The ambient light sensor sits
/// next to the camera, so its readings are meaningless in that state.
#[cfg(target_os = "macos")]
pub fn is_clamshell_closed() -> Result<bool> {
    let output = std::process::Command::new("/usr/sbin/ioreg")
        .args(["-r", "-k", "AppleClamshellState", "-d", "4"])
        .output()
        .context("Failed to run ioreg")?;

    if !output.status.success() {
        bail!("ioreg exited with {}", output.status);
    }

    Ok(parse_clamshell_state(&String::from_utf8_lossy(&output.stdout)))
}

#[cfg(not(target_os = "macos"))]
pub fn is_clamshell_closed() -> Result<bool> {
    Ok(false)
}

/// Extract `"AppleClamshellState" = Yes|No` from `ioreg` output.
pub fn parse_clamshell_state(ioreg_output: &str) -> bool {
    ioreg_output
        .lines()
        .find(|line| line.contains("\"AppleClamshellState\""))
        .map(|line| line.trim_end().ends_with("Yes"))
        .unwrap_or(false)
}

/// Open connection to the `AppleLMUController` service found on older Macs.
#[cfg(target_os = "macos")]
pub struct LmuConnection {
    connect: mach_port_t,
}

// The connection is a mach port name, usable from any thread.
#[cfg(target_os = "macos")]
unsafe impl Send for LmuConnection {}

#[cfg(target_os = "macos")]
fn lmu_service() -> Option<mach_port_t> {
    unsafe {
        let matching = IOServiceMatching(LMU_SERVICE_NAME.as_ptr());
        if matching.is_null() {
            return None;
        }
        // Consumes `matching`.
        let service = IOServiceGetMatchingService(MACH_PORT_NULL, matching);
        (service != MACH_PORT_NULL).then_some(service)
    }
}

#[cfg(target_os = "macos")]
pub fn lmu_service_present() -> bool {
    match lmu_service() {
        Some(service) => {
            unsafe {
                IOObjectRelease(service);
            }
            true
        }
        None => false,
    }
}

#[cfg(target_os = "macos")]
impl LmuConnection {
    pub fn open() -> Result<Self> {
        let service = lmu_service().ok_or_else(|| anyhow!("AppleLMUController service not found"))?;
        let mut connect: mach_port_t = MACH_PORT_NULL;
        let status = unsafe {
            let status = IOServiceOpen(service, mach_task_self(), 0, &mut connect);
            IOObjectRelease(service);
            status
        };

        if status != KERN_SUCCESS {
            bail!("IOServiceOpen on AppleLMUController failed with {status:#x}");
        }

        Ok(Self { connect })
    }

    /// Both raw light channels (left and right sensor).
    pub fn read_channels(&self) -> Result<[u64; 2]> {
        let mut values = [0u64; 2];
        let mut count: u32 = 2;
        let status = unsafe {
            IOConnectCallMethod(
                self.connect,
                LMU_READ_SELECTOR,
                std::ptr::null(),
                0,
                std::ptr::null(),
                0,
                values.as_mut_ptr(),
                &mut count,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };

        if status != KERN_SUCCESS {
            bail!("AppleLMUController read failed with {status:#x}");
        }
        if count == 0 {
            bail!("AppleLMUController returned no channels");
        }
        if count == 1 {
            values[1] = values[0];
        }

        Ok(values)
    }
}

#[cfg(target_os = "macos")]
impl Drop for LmuConnection {
    fn drop(&mut self) {
        unsafe {
            IOServiceClose(self.connect);
        }
    }
}

/// HID event system client matched to the ambient light sensor services of
/// newer Macs.
#[cfg(target_os = "macos")]
pub struct HidAlsClient {
    client: CFTypeRef,
}

// The client is only touched by the sensor that owns it, one call at a time.
#[cfg(target_os = "macos")]
unsafe impl Send for HidAlsClient {}

#[cfg(target_os = "macos")]
unsafe fn cf_string(value: &CStr) -> CFTypeRef {
    CFStringCreateWithCString(kCFAllocatorDefault, value.as_ptr(), K_CF_STRING_ENCODING_UTF8)
}

#[cfg(target_os = "macos")]
unsafe fn cf_number(value: i32) -> CFTypeRef {
    CFNumberCreate(
        kCFAllocatorDefault,
        K_CF_NUMBER_SINT32_TYPE,
        &value as *const i32 as *const c_void,
    )
}

#[cfg(target_os = "macos")]
impl HidAlsClient {
    pub fn open() -> Result<Self> {
        unsafe {
            let client = IOHIDEventSystemClientCreate(kCFAllocatorDefault);
            if client.is_null() {
                bail!("IOHIDEventSystemClientCreate returned null");
            }

            let keys = [cf_string(c"PrimaryUsagePage"), cf_string(c"PrimaryUsage")];
            let values = [cf_number(HID_ALS_USAGE_PAGE), cf_number(HID_ALS_USAGE)];
            let matching = CFDictionaryCreate(
                kCFAllocatorDefault,
                keys.as_ptr(),
                values.as_ptr(),
                keys.len() as CFIndex,
                &kCFTypeDictionaryKeyCallBacks,
                &kCFTypeDictionaryValueCallBacks,
            );
            for object in keys.iter().chain(values.iter()) {
                if !object.is_null() {
                    CFRelease(*object);
                }
            }

            if matching.is_null() {
                CFRelease(client);
                bail!("Failed to build HID matching dictionary");
            }

            IOHIDEventSystemClientSetMatching(client, matching);
            CFRelease(matching);

            Ok(Self { client })
        }
    }

    /// Number of HID services matching the ambient light sensor usage.
    pub fn service_count(&self) -> usize {
        unsafe {
            let services = IOHIDEventSystemClientCopyServices(self.client);
            if services.is_null() {
                return 0;
            }
            let count = CFArrayGetCount(services);
            CFRelease(services);
            count.max(0) as usize
        }
    }

    /// Light level in lux from the first service that produces an event.
    pub fn read_lux(&self) -> Result<f64> {
        unsafe {
            let services = IOHIDEventSystemClientCopyServices(self.client);
            if services.is_null() {
                bail!("no HID ambient light services");
            }

            let mut level = None;
            for index in 0..CFArrayGetCount(services) {
                let service = CFArrayGetValueAtIndex(services, index);
                if service.is_null() {
                    continue;
                }
                let event =
                    IOHIDServiceClientCopyEvent(service, HID_EVENT_TYPE_AMBIENT_LIGHT, 0, 0);
                if event.is_null() {
                    continue;
                }
                level = Some(IOHIDEventGetFloatValue(event, HID_AMBIENT_LIGHT_LEVEL_FIELD));
                CFRelease(event);
                break;
            }
            CFRelease(services);

            level.ok_or_else(|| anyhow!("no HID ambient light service produced an event"))
        }
    }
}

#[cfg(target_os = "macos")]
impl Drop for HidAlsClient {
    fn drop(&mut self) {
        unsafe {
            CFRelease(self.client);
        }
    }
}

#[cfg(target_os = "macos")]
pub fn hid_als_service_present() -> bool {
    HidAlsClient::open()
        .map(|client| client.service_count() > 0)
        .unwrap_or(false)
}

// Fallbacks for platforms without either sensor interface.

#[cfg(not(target_os = "macos"))]
pub struct LmuConnection {
    _private: (),
}

#[cfg(not(target_os = "macos"))]
impl LmuConnection {
    pub fn open() -> Result<Self> {
        anyhow::bail!("AppleLMUController is only available on macOS")
    }

    pub fn read_channels(&self) -> Result<[u64; 2]> {
        anyhow::bail!("AppleLMUController is only available on macOS")
    }
}

#[cfg(not(target_os = "macos"))]
pub fn lmu_service_present() -> bool {
    false
}

#[cfg(not(target_os = "macos"))]
pub struct HidAlsClient {
    _private: (),
}

#[cfg(not(target_os = "macos"))]
impl HidAlsClient {
    pub fn open() -> Result<Self> {
        anyhow::bail!("the HID ambient light sensor is only available on macOS")
    }

    pub fn read_lux(&self) -> Result<f64> {
        anyhow::bail!("the HID ambient light sensor is only available on macOS")
    }
}

#[cfg(not(target_os = "macos"))]
pub fn hid_als_service_present() -> bool {
    false
}
