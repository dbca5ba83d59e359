//! Windows WinTun backend.
//!
//! `wintun.dll` is loaded dynamically and its entry points resolved by
//! name. The adapter is opened by name when it already exists, otherwise
//! created with a fresh GUID; a session with a 4 MiB ring buffer carries
//! packets. The session's read-wait event wakes a background thread that
//! drains received packets into an in-memory queue, which `read_packet`
//! serves without blocking.

use std::collections::VecDeque;
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, warn};

use crate::constants::{WINTUN_MAX_ADAPTER_NAME, WINTUN_RING_CAPACITY};
use crate::error::{Error, Result};

use super::{TunDevice, check_packet_len, check_read_len};

/// Adapter name used when the caller supplies no hint.
const DEFAULT_ADAPTER_NAME: &str = "CDTunnel";

/// Tunnel type registered with the WinTun driver.
const TUNNEL_TYPE: &str = "CDTunnel";

/// Candidate locations for the driver DLL, tried in order.
const DLL_PATHS: [&str; 4] = ["wintun.dll", ".\\wintun.dll", "..\\wintun.dll", "bin\\wintun.dll"];

const ERROR_NO_MORE_ITEMS: u32 = 259;
const WAIT_OBJECT_0: u32 = 0;
const READ_WAIT_SLICE_MS: u32 = 100;

type Handle = *mut c_void;

#[repr(C)]
#[derive(Clone, Copy)]
struct Guid {
    data1: u32,
    data2: u16,
    data3: u16,
    data4: [u8; 8],
}

#[link(name = "kernel32")]
extern "system" {
    fn LoadLibraryW(file_name: *const u16) -> Handle;
    fn GetProcAddress(module: Handle, proc_name: *const u8) -> *mut c_void;
    fn FreeLibrary(module: Handle) -> i32;
    fn GetLastError() -> u32;
    fn WaitForSingleObject(handle: Handle, timeout_ms: u32) -> u32;
    fn SetEvent(handle: Handle) -> i32;
}

type CreateAdapterFn =
    unsafe extern "system" fn(*const u16, *const u16, *const Guid) -> Handle;
type OpenAdapterFn = unsafe extern "system" fn(*const u16) -> Handle;
type CloseAdapterFn = unsafe extern "system" fn(Handle);
type StartSessionFn = unsafe extern "system" fn(Handle, u32) -> Handle;
type EndSessionFn = unsafe extern "system" fn(Handle);
type GetReadWaitEventFn = unsafe extern "system" fn(Handle) -> Handle;
type ReceivePacketFn = unsafe extern "system" fn(Handle, *mut u32) -> *mut u8;
type ReleaseReceivePacketFn = unsafe extern "system" fn(Handle, *const u8);
type AllocateSendPacketFn = unsafe extern "system" fn(Handle, u32) -> *mut u8;
type SendPacketFn = unsafe extern "system" fn(Handle, *const u8);

struct WintunApi {
    module: Handle,
    create_adapter: CreateAdapterFn,
    open_adapter: OpenAdapterFn,
    close_adapter: CloseAdapterFn,
    start_session: StartSessionFn,
    end_session: EndSessionFn,
    get_read_wait_event: GetReadWaitEventFn,
    receive_packet: ReceivePacketFn,
    release_receive_packet: ReleaseReceivePacketFn,
    allocate_send_packet: AllocateSendPacketFn,
    send_packet: SendPacketFn,
}

// The WinTun handles are documented thread-safe; all mutation goes through
// the per-device lock.
unsafe impl Send for WintunApi {}
unsafe impl Sync for WintunApi {}

impl WintunApi {
    fn load() -> Result<Self> {
        let mut module: Handle = std::ptr::null_mut();
        for path in DLL_PATHS {
            let wide = to_utf16_null(path);
            module = unsafe { LoadLibraryW(wide.as_ptr()) };
            if !module.is_null() {
                break;
            }
        }
        if module.is_null() {
            return Err(Error::DeviceUnavailable {
                message: "wintun.dll not found; download it from https://www.wintun.net/".into(),
            });
        }

        unsafe {
            Ok(Self {
                module,
                create_adapter: resolve(module, b"WintunCreateAdapter\0")?,
                open_adapter: resolve(module, b"WintunOpenAdapter\0")?,
                close_adapter: resolve(module, b"WintunCloseAdapter\0")?,
                start_session: resolve(module, b"WintunStartSession\0")?,
                end_session: resolve(module, b"WintunEndSession\0")?,
                get_read_wait_event: resolve(module, b"WintunGetReadWaitEvent\0")?,
                receive_packet: resolve(module, b"WintunReceivePacket\0")?,
                release_receive_packet: resolve(module, b"WintunReleaseReceivePacket\0")?,
                allocate_send_packet: resolve(module, b"WintunAllocateSendPacket\0")?,
                send_packet: resolve(module, b"WintunSendPacket\0")?,
            })
        }
    }
}

unsafe fn resolve<F>(module: Handle, name: &'static [u8]) -> Result<F> {
    let proc = GetProcAddress(module, name.as_ptr());
    if proc.is_null() {
        return Err(Error::DeviceUnavailable {
            message: format!(
                "wintun.dll is missing {}",
                String::from_utf8_lossy(&name[..name.len() - 1])
            ),
        });
    }
    Ok(std::mem::transmute_copy(&proc))
}

struct Runtime {
    api: Arc<WintunApi>,
    adapter: Handle,
    session: Handle,
    read_event: Handle,
}

unsafe impl Send for Runtime {}

struct Inner {
    runtime: Option<Runtime>,
    reader: Option<JoinHandle<()>>,
}

/// WinTun adapter handle.
pub struct WintunDevice {
    inner: Mutex<Inner>,
    received: Arc<Mutex<VecDeque<Vec<u8>>>>,
    stop: Arc<AtomicBool>,
    closed: AtomicBool,
    name: String,
}

impl WintunDevice {
    /// Create or open the named WinTun adapter and start its session.
    pub fn open(name_hint: Option<&str>) -> Result<Self> {
        let name = match name_hint {
            Some(hint) if !hint.is_empty() => hint.to_string(),
            _ => DEFAULT_ADAPTER_NAME.to_string(),
        };
        if name.len() > WINTUN_MAX_ADAPTER_NAME {
            return Err(Error::invalid_argument(format!(
                "adapter name exceeds {WINTUN_MAX_ADAPTER_NAME} characters"
            )));
        }

        let api = Arc::new(WintunApi::load()?);
        let name_w = to_utf16_null(&name);

        // Reuse an existing adapter before creating a new one.
        let mut adapter = unsafe { (api.open_adapter)(name_w.as_ptr()) };
        if adapter.is_null() {
            let tunnel_type_w = to_utf16_null(TUNNEL_TYPE);
            let guid = random_guid();
            adapter =
                unsafe { (api.create_adapter)(name_w.as_ptr(), tunnel_type_w.as_ptr(), &guid) };
        }
        if adapter.is_null() {
            let code = unsafe { GetLastError() };
            return Err(classify_win32(
                code,
                format!("WintunCreateAdapter '{name}' failed (error {code})"),
            ));
        }

        let session = unsafe { (api.start_session)(adapter, WINTUN_RING_CAPACITY) };
        if session.is_null() {
            let code = unsafe { GetLastError() };
            unsafe { (api.close_adapter)(adapter) };
            return Err(classify_win32(
                code,
                format!("WintunStartSession failed (error {code})"),
            ));
        }

        let read_event = unsafe { (api.get_read_wait_event)(session) };
        if read_event.is_null() {
            unsafe {
                (api.end_session)(session);
                (api.close_adapter)(adapter);
            }
            return Err(Error::DeviceUnavailable {
                message: "WintunGetReadWaitEvent returned no handle".into(),
            });
        }

        let received = Arc::new(Mutex::new(VecDeque::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let reader = match spawn_reader(
            Arc::clone(&api),
            SessionRef(session),
            EventRef(read_event),
            Arc::clone(&received),
            Arc::clone(&stop),
        ) {
            Ok(reader) => reader,
            Err(err) => {
                unsafe {
                    (api.end_session)(session);
                    (api.close_adapter)(adapter);
                }
                return Err(Error::Io(err));
            }
        };

        debug!(name, "opened wintun adapter");
        Ok(Self {
            inner: Mutex::new(Inner {
                runtime: Some(Runtime {
                    api,
                    adapter,
                    session,
                    read_event,
                }),
                reader: Some(reader),
            }),
            received,
            stop,
            closed: AtomicBool::new(false),
            name,
        })
    }
}

/// Raw session handle wrapper so the reader thread can own a copy.
struct SessionRef(Handle);
unsafe impl Send for SessionRef {}

struct EventRef(Handle);
unsafe impl Send for EventRef {}

/// Background poller: the read event wakes it, packets drain into the
/// shared queue until stop is requested.
fn spawn_reader(
    api: Arc<WintunApi>,
    session: SessionRef,
    event: EventRef,
    received: Arc<Mutex<VecDeque<Vec<u8>>>>,
    stop: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("wintun-reader".into())
        .spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                let wait = unsafe { WaitForSingleObject(event.0, READ_WAIT_SLICE_MS) };
                if wait != WAIT_OBJECT_0 || stop.load(Ordering::SeqCst) {
                    continue;
                }

                loop {
                    let mut size: u32 = 0;
                    let packet = unsafe { (api.receive_packet)(session.0, &mut size) };
                    if packet.is_null() {
                        let code = unsafe { GetLastError() };
                        if code != ERROR_NO_MORE_ITEMS {
                            warn!(code, "wintun receive failed");
                        }
                        break;
                    }
                    let data =
                        unsafe { std::slice::from_raw_parts(packet, size as usize) }.to_vec();
                    unsafe { (api.release_receive_packet)(session.0, packet) };
                    received.lock().expect("receive queue lock").push_back(data);
                }
            }
        })
}

impl TunDevice for WintunDevice {
    fn read_packet(&self, max_len: usize) -> Result<Vec<u8>> {
        check_read_len(max_len)?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::AlreadyClosed);
        }

        let mut queue = self.received.lock().expect("receive queue lock");
        match queue.pop_front() {
            Some(mut packet) => {
                packet.truncate(max_len);
                Ok(packet)
            }
            None => Ok(Vec::new()),
        }
    }

    fn write_packet(&self, packet: &[u8]) -> Result<usize> {
        check_packet_len(packet.len())?;
        if packet.is_empty() {
            return Ok(0);
        }

        let inner = self.inner.lock().expect("device lock");
        let runtime = inner.runtime.as_ref().ok_or(Error::AlreadyClosed)?;

        let buf =
            unsafe { (runtime.api.allocate_send_packet)(runtime.session, packet.len() as u32) };
        if buf.is_null() {
            let code = unsafe { GetLastError() };
            return Err(Error::Io(std::io::Error::other(format!(
                "WintunAllocateSendPacket failed (error {code})"
            ))));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(packet.as_ptr(), buf, packet.len());
            (runtime.api.send_packet)(runtime.session, buf);
        }
        Ok(packet.len())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut inner = self.inner.lock().expect("device lock");
        self.stop.store(true, Ordering::SeqCst);
        if let Some(runtime) = inner.runtime.take() {
            // Wake the reader so it observes the stop flag.
            unsafe { SetEvent(runtime.read_event) };
            if let Some(reader) = inner.reader.take() {
                let _ = reader.join();
            }
            unsafe {
                (runtime.api.end_session)(runtime.session);
                (runtime.api.close_adapter)(runtime.adapter);
                FreeLibrary(runtime.api.module);
            }
        }
        self.received.lock().expect("receive queue lock").clear();
        debug!(name = %self.name, "closed wintun adapter");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn handle_id(&self) -> i64 {
        let inner = self.inner.lock().expect("device lock");
        inner
            .runtime
            .as_ref()
            .map_or(-1, |rt| rt.read_event as i64)
    }
}

impl Drop for WintunDevice {
    fn drop(&mut self) {
        self.close();
    }
}

fn to_utf16_null(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn random_guid() -> Guid {
    let bytes: [u8; 16] = rand::random();
    Guid {
        data1: u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        data2: u16::from_ne_bytes([bytes[4], bytes[5]]),
        data3: u16::from_ne_bytes([bytes[6], bytes[7]]),
        data4: [
            bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15],
        ],
    }
}

fn classify_win32(code: u32, message: String) -> Error {
    const ERROR_ACCESS_DENIED: u32 = 5;
    if code == ERROR_ACCESS_DENIED {
        Error::PermissionDenied { message }
    } else {
        Error::DeviceUnavailable { message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf16_conversion_is_null_terminated() {
        let wide = to_utf16_null("CDTunnel");
        assert_eq!(wide.last(), Some(&0));
        assert_eq!(wide.len(), "CDTunnel".len() + 1);
    }

    #[test]
    fn guid_is_sixteen_bytes() {
        assert_eq!(std::mem::size_of::<Guid>(), 16);
    }

    #[test]
    #[ignore = "requires administrator privileges and wintun.dll"]
    fn open_and_close_adapter() {
        let dev = WintunDevice::open(Some("cdtun-test")).unwrap();
        assert_eq!(dev.name(), "cdtun-test");
        assert!(dev.read_packet(2048).unwrap().is_empty());
        dev.close();
        assert!(matches!(dev.read_packet(2048), Err(Error::AlreadyClosed)));
    }
}
