//! System proxy configuration.
//!
//! Points the operating system's HTTP and HTTPS proxy settings at the capture
//! proxy and reverts them. Every platform sits behind
//! [`SystemProxyController`]; [`platform_controller`] picks the one for the
//! running OS. All of this is best effort: failures come back as a
//! [`SetupResult`] and never as a panic or error.

use std::io;
use std::process::Command;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

/// Result of a setup operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SetupResult {
    /// Whether the operation succeeded.
    pub success: bool,
    /// Human-readable message.
    pub message: String,
    /// Underlying failure, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SetupResult {
    /// A successful result.
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            error: None,
        }
    }

    /// A failed result.
    pub fn failure(message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            error: Some(error.into()),
        }
    }
}

// ============================================================================
// Command execution
// ============================================================================

/// Captured result of an external command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Whether the process exited with status zero.
    pub success: bool,
    /// Standard output, lossily decoded.
    pub stdout: String,
    /// Standard error, lossily decoded.
    pub stderr: String,
}

/// Runs external commands on behalf of a controller.
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with `args` and waits for it to exit.
    fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput>;
}

/// [`CommandRunner`] backed by [`std::process::Command`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput> {
        let mut command = Command::new(program);
        command.args(args);

        #[cfg(target_os = "windows")]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            command.creation_flags(CREATE_NO_WINDOW);
        }

        let output = command.output()?;
        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Runs a command and turns spawn errors and non-zero exits into a message.
fn run_checked(
    runner: &dyn CommandRunner,
    program: &str,
    args: &[&str],
) -> std::result::Result<CommandOutput, String> {
    let label = format!("{} {}", program, args.first().copied().unwrap_or_default());
    match runner.run(program, args) {
        Ok(out) if out.success => Ok(out),
        Ok(out) => {
            let detail = out.stderr.trim();
            let detail = if detail.is_empty() { out.stdout.trim() } else { detail };
            Err(format!("`{}` failed: {}", label, detail))
        }
        Err(e) => Err(format!("failed to run `{}`: {}", label, e)),
    }
}

// ============================================================================
// Controller trait
// ============================================================================

/// Turns the OS-level HTTP/HTTPS proxy on and off.
pub trait SystemProxyController: Send + Sync {
    /// Points the system proxy at `host:port`.
    fn enable(&self, host: &str, port: u16) -> SetupResult;

    /// Turns the system proxy off. Safe to call repeatedly.
    fn disable(&self) -> SetupResult;

    /// Whether the system proxy currently points at `host:port`.
    fn is_enabled(&self, host: &str, port: u16) -> bool;
}

/// Returns the controller for the running OS.
pub fn platform_controller() -> Box<dyn SystemProxyController> {
    #[cfg(target_os = "macos")]
    {
        Box::new(MacOsController::new())
    }

    #[cfg(target_os = "windows")]
    {
        Box::new(WindowsController::new())
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        Box::new(UnsupportedController)
    }
}

// ============================================================================
// macOS Implementation
// ============================================================================

const NETWORKSETUP: &str = "networksetup";

/// Services tried first, in order, when looking for the active one.
const PREFERRED_SERVICES: &[&str] = &["Wi-Fi", "Ethernet", "USB 10/100/1000 LAN"];

const FALLBACK_SERVICE: &str = "Wi-Fi";

/// Drives `networksetup` on macOS.
///
/// The network service chosen by [`enable`](SystemProxyController::enable) is
/// remembered so that [`disable`](SystemProxyController::disable) reverts the
/// same service even if the active interface changed in between.
pub struct MacOsController {
    runner: Arc<dyn CommandRunner>,
    service: Mutex<Option<String>>,
}

impl std::fmt::Debug for MacOsController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacOsController")
            .field("service", &*self.service.lock())
            .finish()
    }
}

impl MacOsController {
    /// Creates a controller that runs real commands.
    pub fn new() -> Self {
        Self::with_runner(Arc::new(SystemCommandRunner))
    }

    /// Creates a controller with a custom command runner.
    pub fn with_runner(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            service: Mutex::new(None),
        }
    }

    /// The service remembered from the last enable, if any.
    pub fn cached_service(&self) -> Option<String> {
        self.service.lock().clone()
    }

    /// Picks the network service to configure.
    fn resolve_service(&self) -> String {
        let listing = match run_checked(
            self.runner.as_ref(),
            NETWORKSETUP,
            &["-listallnetworkservices"],
        ) {
            Ok(out) => out.stdout,
            Err(e) => {
                tracing::warn!("Could not list network services: {}", e);
                return FALLBACK_SERVICE.to_string();
            }
        };

        // First line is an explanatory header; `*` marks disabled services.
        let services: Vec<&str> = listing
            .lines()
            .skip(1)
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('*'))
            .collect();

        for preferred in PREFERRED_SERVICES {
            if services.contains(preferred) && self.has_ip_address(preferred) {
                return preferred.to_string();
            }
        }

        services
            .first()
            .map(|s| s.to_string())
            .unwrap_or_else(|| FALLBACK_SERVICE.to_string())
    }

    fn has_ip_address(&self, service: &str) -> bool {
        match run_checked(self.runner.as_ref(), NETWORKSETUP, &["-getinfo", service]) {
            Ok(out) => out.stdout.lines().any(|line| {
                line.strip_prefix("IP address:")
                    .map(str::trim)
                    .is_some_and(|addr| !addr.is_empty() && addr != "none")
            }),
            Err(_) => false,
        }
    }
}

impl Default for MacOsController {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProxyController for MacOsController {
    fn enable(&self, host: &str, port: u16) -> SetupResult {
        let service = self.resolve_service();
        *self.service.lock() = Some(service.clone());

        let port_str = port.to_string();
        let steps: [&[&str]; 4] = [
            &["-setwebproxy", service.as_str(), host, port_str.as_str()],
            &["-setsecurewebproxy", service.as_str(), host, port_str.as_str()],
            &["-setwebproxystate", service.as_str(), "on"],
            &["-setsecurewebproxystate", service.as_str(), "on"],
        ];

        for args in steps {
            if let Err(e) = run_checked(self.runner.as_ref(), NETWORKSETUP, args) {
                tracing::warn!("Enabling proxy on {} failed: {}", service, e);
                return SetupResult::failure(
                    format!("Failed to set proxy on {}. May need administrator privileges.", service),
                    e,
                );
            }
        }

        tracing::info!("System proxy enabled on {} ({}:{})", service, host, port);
        SetupResult::success(format!(
            "System proxy enabled on {} ({}:{})",
            service, host, port
        ))
    }

    fn disable(&self) -> SetupResult {
        let service = match self.cached_service() {
            Some(service) => service,
            None => self.resolve_service(),
        };

        for args in [
            ["-setwebproxystate", service.as_str(), "off"],
            ["-setsecurewebproxystate", service.as_str(), "off"],
        ] {
            if let Err(e) = run_checked(self.runner.as_ref(), NETWORKSETUP, &args) {
                tracing::warn!("Disabling proxy on {} failed: {}", service, e);
                return SetupResult::failure(
                    format!("Failed to disable proxy on {}", service),
                    e,
                );
            }
        }

        *self.service.lock() = None;
        tracing::info!("System proxy disabled on {}", service);
        SetupResult::success(format!("System proxy disabled on {}", service))
    }

    fn is_enabled(&self, host: &str, port: u16) -> bool {
        let service = match self.cached_service() {
            Some(service) => service,
            None => self.resolve_service(),
        };

        match run_checked(self.runner.as_ref(), NETWORKSETUP, &["-getwebproxy", service.as_str()]) {
            Ok(out) => {
                out.stdout.contains("Enabled: Yes")
                    && out.stdout.contains(&format!("Server: {}", host))
                    && out.stdout.contains(&format!("Port: {}", port))
            }
            Err(_) => false,
        }
    }
}

// ============================================================================
// Windows Implementation
// ============================================================================

const INTERNET_SETTINGS_KEY: &str =
    r"HKCU\Software\Microsoft\Windows\CurrentVersion\Internet Settings";

/// Writes the per-user WinINet proxy settings with `reg`.
pub struct WindowsController {
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for WindowsController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowsController").finish_non_exhaustive()
    }
}

impl WindowsController {
    /// Creates a controller that runs real commands.
    pub fn new() -> Self {
        Self::with_runner(Arc::new(SystemCommandRunner))
    }

    /// Creates a controller with a custom command runner.
    pub fn with_runner(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn set_value(&self, name: &str, kind: &str, data: &str) -> std::result::Result<(), String> {
        run_checked(
            self.runner.as_ref(),
            "reg",
            &["add", INTERNET_SETTINGS_KEY, "/v", name, "/t", kind, "/d", data, "/f"],
        )
        .map(|_| ())
    }

    fn query_value(&self, name: &str) -> Option<String> {
        run_checked(
            self.runner.as_ref(),
            "reg",
            &["query", INTERNET_SETTINGS_KEY, "/v", name],
        )
        .ok()
        .map(|out| out.stdout)
    }
}

impl Default for WindowsController {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProxyController for WindowsController {
    fn enable(&self, host: &str, port: u16) -> SetupResult {
        let proxy_server = format!("{}:{}", host, port);

        let written = self
            .set_value("ProxyEnable", "REG_DWORD", "1")
            .and_then(|_| self.set_value("ProxyServer", "REG_SZ", &proxy_server));
        if let Err(e) = written {
            tracing::warn!("Enabling system proxy failed: {}", e);
            return SetupResult::failure("Failed to enable system proxy", e);
        }

        // WinHTTP clients keep their own copy of the setting.
        if let Err(e) = run_checked(
            self.runner.as_ref(),
            "netsh",
            &["winhttp", "import", "proxy", "source=ie"],
        ) {
            tracing::debug!("WinHTTP refresh skipped: {}", e);
        }

        tracing::info!("System proxy enabled: {}", proxy_server);
        SetupResult::success(format!("System proxy enabled: {}", proxy_server))
    }

    fn disable(&self) -> SetupResult {
        match self.set_value("ProxyEnable", "REG_DWORD", "0") {
            Ok(()) => {
                tracing::info!("System proxy disabled");
                SetupResult::success("System proxy disabled")
            }
            Err(e) => {
                tracing::warn!("Disabling system proxy failed: {}", e);
                SetupResult::failure("Failed to disable system proxy", e)
            }
        }
    }

    fn is_enabled(&self, host: &str, port: u16) -> bool {
        let enabled = self
            .query_value("ProxyEnable")
            .is_some_and(|out| out.contains("0x1"));
        enabled
            && self
                .query_value("ProxyServer")
                .is_some_and(|out| out.contains(&format!("{}:{}", host, port)))
    }
}

// ============================================================================
// Other platforms
// ============================================================================

/// Controller for platforms without automatic proxy configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedController;

impl SystemProxyController for UnsupportedController {
    fn enable(&self, _host: &str, _port: u16) -> SetupResult {
        SetupResult::failure(
            "Automatic proxy configuration is not available on this platform",
            "unsupported OS",
        )
    }

    fn disable(&self) -> SetupResult {
        SetupResult::failure(
            "Automatic proxy configuration is not available on this platform",
            "unsupported OS",
        )
    }

    fn is_enabled(&self, _host: &str, _port: u16) -> bool {
        false
    }
}

// ============================================================================
// Manual instructions
// ============================================================================

/// Returns manual setup steps for pointing the running OS at `host:port`.
pub fn manual_proxy_instructions(host: &str, port: u16) -> String {
    let steps = if cfg!(target_os = "macos") {
        MACOS_STEPS
    } else if cfg!(target_os = "windows") {
        WINDOWS_STEPS
    } else {
        GENERIC_STEPS
    };

    format_instructions(steps, host, port)
}

const MACOS_STEPS: &str = "\
1. Open System Settings > Network and select the active service (e.g. Wi-Fi).
2. Click Details > Proxies.
3. Enable \"Web proxy (HTTP)\" and \"Secure web proxy (HTTPS)\".
4. Set both servers to {addr}.
5. Click OK, then restart the target application.";

const WINDOWS_STEPS: &str = "\
1. Open Settings > Network & Internet > Proxy.
2. Under \"Manual proxy setup\", turn on \"Use a proxy server\".
3. Set Address to {host} and Port to {port}.
4. Click Save, then restart the target application.";

const GENERIC_STEPS: &str = "\
1. Open your system or desktop environment network settings.
2. Set the HTTP and HTTPS proxy to {addr}.
3. Alternatively export http_proxy=http://{addr} and https_proxy=http://{addr}.
4. Restart the target application.";

fn format_instructions(steps: &str, host: &str, port: u16) -> String {
    let addr = format!("{}:{}", host, port);
    let body = steps
        .replace("{addr}", &addr)
        .replace("{host}", host)
        .replace("{port}", &port.to_string());
    format!(
        "Automatic proxy configuration is unavailable. Point your system proxy at {} manually:\n\n{}",
        addr, body
    )
}

// ============================================================================
// Tests
// ============================================================================
