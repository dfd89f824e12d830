use libc::{c_char, c_void};
use std::env;
use std::ffi::{CStr, CString};
use std::ptr;
use std::time::Duration;
use tun_bridge::ffi::{BridgeHelperConfig, BridgeLogSink};
use tun_bridge::supervisor::{HelperConfig, HelperMonitor, DEFAULT_MONITOR_INTERVAL};
use tun_bridge::{BridgeSetBreadcrumbMask, BridgeSetLogSink, BridgeStartHelperProcess};

fn main() -> anyhow::Result<()> {
    let settings = Settings::parse()?;
    install_log_sink();
    BridgeSetBreadcrumbMask(u32::MAX);

    eprintln!(
        "[standalone] launching helper: {}",
        settings.helper.argv().join(" ")
    );

    let strings = HelperStrings::new(&settings.helper)?;
    let pid = unsafe { BridgeStartHelperProcess(&strings.as_ffi()) };
    if pid < 0 {
        anyhow::bail!("BridgeStartHelperProcess failed");
    }
    println!("[standalone] helper running as pid {pid}. Press Ctrl+C to terminate.");

    let (_monitor, deaths) = HelperMonitor::spawn(vec![pid], settings.poll_interval)?;
    let death = deaths.recv()?;
    match death.exit {
        Some(exit) if exit.is_exec_failure() => {
            anyhow::bail!(
                "helper pid {pid} could not exec {}",
                settings.helper.binary_path
            )
        }
        Some(exit) => println!("[standalone] helper pid {pid} exited: {exit:?}"),
        None => println!("[standalone] helper pid {pid} is no longer waitable"),
    }
    Ok(())
}

#[derive(Debug)]
struct Settings {
    helper: HelperConfig,
    poll_interval: Duration,
}

impl Settings {
    fn parse() -> anyhow::Result<Self> {
        let mut helper = HelperConfig::default();
        let mut poll_interval = DEFAULT_MONITOR_INTERVAL;
        let mut args = env::args().skip(1);
        while let Some(arg) = args.next() {
            let mut value = || {
                args.next()
                    .ok_or_else(|| anyhow::anyhow!("{arg} requires a value"))
            };
            match arg.as_str() {
                "--helper" => helper.binary_path = value()?,
                "--tun-fd" => {
                    helper.tun_fd = value()?
                        .parse()
                        .map_err(|_| anyhow::anyhow!("invalid tun fd"))?;
                }
                "--address" => helper.address = value()?,
                "--netmask" => helper.netmask = value()?,
                "--socks" => helper.socks_server = value()?,
                "--udpgw" => helper.udpgw_addr = value()?,
                "--dnsgw" => helper.dnsgw_addr = value()?,
                "--poll-ms" => {
                    let millis: u64 = value()?
                        .parse()
                        .map_err(|_| anyhow::anyhow!("invalid poll interval"))?;
                    poll_interval = Duration::from_millis(millis.max(1));
                }
                _ => {
                    anyhow::bail!(
                        "unknown argument '{}'. Supported flags: --helper <path>, --tun-fd <fd>, --address <ip>, --netmask <mask>, --socks <addr>, --udpgw <addr>, --dnsgw <addr>, --poll-ms <millis>",
                        arg
                    );
                }
            }
        }
        if helper.binary_path.is_empty() {
            anyhow::bail!("--helper is required");
        }
        Ok(Self {
            helper,
            poll_interval,
        })
    }
}

/// Owns the C strings behind a `BridgeHelperConfig`.
struct HelperStrings {
    binary_path: CString,
    tun_fd: i32,
    address: CString,
    netmask: CString,
    socks_server: CString,
    udpgw_addr: CString,
    dnsgw_addr: CString,
}

impl HelperStrings {
    fn new(config: &HelperConfig) -> anyhow::Result<Self> {
        Ok(Self {
            binary_path: CString::new(config.binary_path.as_str())?,
            tun_fd: config.tun_fd,
            address: CString::new(config.address.as_str())?,
            netmask: CString::new(config.netmask.as_str())?,
            socks_server: CString::new(config.socks_server.as_str())?,
            udpgw_addr: CString::new(config.udpgw_addr.as_str())?,
            dnsgw_addr: CString::new(config.dnsgw_addr.as_str())?,
        })
    }

    fn as_ffi(&self) -> BridgeHelperConfig {
        BridgeHelperConfig {
            binary_path: self.binary_path.as_ptr(),
            tun_fd: self.tun_fd,
            address: self.address.as_ptr(),
            netmask: self.netmask.as_ptr(),
            socks_server: self.socks_server.as_ptr(),
            udpgw_addr: self.udpgw_addr.as_ptr(),
            dnsgw_addr: self.dnsgw_addr.as_ptr(),
        }
    }
}

fn install_log_sink() {
    unsafe extern "C" fn log_sink(
        level: *const c_char,
        message: *const c_char,
        _breadcrumbs: u32,
        _context: *mut c_void,
    ) {
        if message.is_null() {
            return;
        }
        let entry = unsafe { CStr::from_ptr(message) }.to_string_lossy();
        let level = if level.is_null() {
            "info".into()
        } else {
            unsafe { CStr::from_ptr(level) }.to_string_lossy()
        };
        println!("[bridge][{level}] {entry}");
    }

    let sink = BridgeLogSink {
        log: Some(log_sink),
        context: ptr::null_mut(),
        enabled_breadcrumbs: u32::MAX,
    };
    let level = CString::new("debug").unwrap();
    unsafe {
        BridgeSetLogSink(&sink, level.as_ptr(), ptr::null_mut());
    }
}
