//! Desktop backend that drives the environment's own command-line tools.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use tracing::{debug, trace};

use crate::error::CoreError;

use super::detect::{DesktopEnv, detect_from};
use super::{DesktopBackend, Result};

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const PORTAL_SETTLE_INTERVAL: Duration = Duration::from_millis(100);

/// Characters escaped when turning a path into a `file://` URI.
const URI_PATH: &AsciiSet = &CONTROLS.add(b' ').add(b'"').add(b'#').add(b'%').add(b'?').add(b'\'');

const PORTAL_DEST: &str = "org.freedesktop.portal.Desktop";
const PORTAL_PATH: &str = "/org/freedesktop/portal/desktop";
const PORTAL_IFACE: &str = "org.freedesktop.portal.Wallpaper";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs an external program. Injected so tests can script desktop responses.
pub trait CommandRunner: Send + Sync + std::fmt::Debug {
    fn run(&self, program: &str, args: &[String], timeout: Duration) -> Result<CommandOutput>;
}

/// Spawns real processes, killing them once the timeout elapses.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String], timeout: Duration) -> Result<CommandOutput> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| CoreError::ApplyCommandFailed {
                program: program.to_string(),
                status: "not started".to_string(),
                stderr: err.to_string(),
            })?;

        // Drained while the child runs so a chatty tool cannot stall on a full pipe.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let started = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if started.elapsed() >= timeout => {
                    let _ = child.kill();
                    let _ = child.wait();
                    collect(stdout);
                    collect(stderr);
                    return Err(CoreError::Timeout { operation: program.to_string(), after: timeout });
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(err) => {
                    return Err(CoreError::ApplyCommandFailed {
                        program: program.to_string(),
                        status: "unknown".to_string(),
                        stderr: err.to_string(),
                    });
                }
            }
        };

        Ok(CommandOutput { code: status.code(), stdout: collect(stdout), stderr: collect(stderr) })
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    let mut pipe = pipe?;
    thread::Builder::new()
        .name("wselector-pipe".into())
        .spawn(move || {
            let mut bytes = Vec::new();
            let _ = pipe.read_to_end(&mut bytes);
            String::from_utf8_lossy(&bytes).into_owned()
        })
        .ok()
}

fn collect(reader: Option<JoinHandle<String>>) -> String {
    reader.and_then(|handle| handle.join().ok()).unwrap_or_default()
}

/// Environment variable lookup used during detection.
pub type VarLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Drives gsettings, plasma, xfconf, hyprpaper, swww, or the wallpaper portal.
///
/// The portal has no read-back of its own. Its result is read through the session's desktop
/// settings, and a session that names no readable desktop never verifies.
pub struct CommandBackend {
    runner: Box<dyn CommandRunner>,
    timeout: Duration,
    vars: VarLookup,
}

impl std::fmt::Debug for CommandBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBackend")
            .field("runner", &self.runner)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl CommandBackend {
    pub fn new(runner: Box<dyn CommandRunner>, timeout: Duration) -> Self {
        Self::with_vars(runner, timeout, Box::new(|key| std::env::var(key).ok()))
    }

    pub fn system(timeout: Duration) -> Self {
        Self::new(Box::new(SystemRunner), timeout)
    }

    /// Use `vars` instead of the process environment during detection.
    pub fn with_vars(runner: Box<dyn CommandRunner>, timeout: Duration, vars: VarLookup) -> Self {
        Self { runner, timeout, vars }
    }

    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let args: Vec<String> = args.iter().map(|arg| arg.to_string()).collect();
        trace!(program, ?args, "running desktop command");
        self.runner.run(program, &args, self.timeout)
    }

    /// Run and require a zero exit status.
    fn run_ok(&self, program: &str, args: &[&str]) -> Result<String> {
        let output = self.run(program, args)?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(CoreError::ApplyCommandFailed {
                program: program.to_string(),
                status: output.code.map_or_else(|| "signal".to_string(), |code| code.to_string()),
                stderr: output.stderr.trim().to_string(),
            })
        }
    }

    fn portal_available(&self) -> bool {
        match self.run("gdbus", &["introspect", "--session", "--dest", PORTAL_DEST, "--object-path", PORTAL_PATH]) {
            Ok(output) => output.success() && output.stdout.contains(PORTAL_IFACE),
            Err(err) => {
                debug!(%err, "wallpaper portal probe failed");
                false
            }
        }
    }

    /// Desktop whose own settings show what the portal applied.
    fn portal_session(&self) -> Option<DesktopEnv> {
        let env = detect_from(|key| (self.vars)(key), false);
        env.is_supported().then_some(env)
    }

    /// The portal replies before the desktop stores the change, so wait until the session
    /// reports `path` or the command timeout passes. Verification judges the final state.
    fn await_portal(&self, session: &DesktopEnv, path: &Path, monitor: Option<&str>) {
        let started = Instant::now();
        loop {
            match self.verify_background(session, monitor) {
                Ok(Some(actual)) if actual == path => return,
                Ok(_) => {}
                Err(err) => {
                    debug!(%err, "portal read-back failed");
                    return;
                }
            }
            if started.elapsed() >= self.timeout {
                return;
            }
            thread::sleep(PORTAL_SETTLE_INTERVAL);
        }
    }

    fn xfce_properties(&self, monitor: Option<&str>) -> Result<Vec<String>> {
        if let Some(monitor) = monitor {
            return Ok(vec![format!("/backdrop/screen0/monitor{monitor}/workspace0/last-image")]);
        }
        let listing = self.run_ok("xfconf-query", &["-c", "xfce4-desktop", "-l"])?;
        let properties: Vec<String> = listing
            .lines()
            .map(str::trim)
            .filter(|line| line.ends_with("/last-image"))
            .map(str::to_string)
            .collect();
        if properties.is_empty() {
            return Err(CoreError::ApplyCommandFailed {
                program: "xfconf-query".to_string(),
                status: "0".to_string(),
                stderr: "no backdrop properties found".to_string(),
            });
        }
        Ok(properties)
    }
}

impl DesktopBackend for CommandBackend {
    fn detect_environment(&self) -> DesktopEnv {
        detect_from(|key| (self.vars)(key), self.portal_available())
    }

    fn set_background(&self, env: &DesktopEnv, path: &Path, monitor: Option<&str>) -> Result<()> {
        let display = path.to_string_lossy();
        let uri = file_uri(path);
        match env {
            DesktopEnv::Portal => {
                self.run_ok(
                    "gdbus",
                    &[
                        "call",
                        "--session",
                        "--dest",
                        PORTAL_DEST,
                        "--object-path",
                        PORTAL_PATH,
                        "--method",
                        "org.freedesktop.portal.Wallpaper.SetWallpaperURI",
                        "",
                        &uri,
                        "{'show-preview': <false>, 'set-on': <'background'>}",
                    ],
                )?;
                if let Some(session) = self.portal_session() {
                    self.await_portal(&session, path, monitor);
                }
            }
            DesktopEnv::Gnome => {
                let schema = "org.gnome.desktop.background";
                self.run_ok("gsettings", &["set", schema, "picture-uri", &uri])?;
                self.run_ok("gsettings", &["set", schema, "picture-uri-dark", &uri])?;
            }
            DesktopEnv::Cinnamon => {
                self.run_ok("gsettings", &["set", "org.cinnamon.desktop.background", "picture-uri", &uri])?;
            }
            DesktopEnv::Mate => {
                self.run_ok("gsettings", &["set", "org.mate.background", "picture-filename", &display])?;
            }
            DesktopEnv::Kde => {
                self.run_ok("plasma-apply-wallpaperimage", &[&display])?;
            }
            DesktopEnv::Xfce => {
                for property in self.xfce_properties(monitor)? {
                    self.run_ok(
                        "xfconf-query",
                        &["-c", "xfce4-desktop", "-p", &property, "--create", "-t", "string", "-s", &display],
                    )?;
                }
            }
            DesktopEnv::Hyprland => {
                let target = format!("{},{display}", monitor.unwrap_or(""));
                self.run_ok("hyprctl", &["hyprpaper", "preload", &display])?;
                self.run_ok("hyprctl", &["hyprpaper", "wallpaper", &target])?;
            }
            DesktopEnv::Wlroots => match monitor {
                Some(output) => {
                    self.run_ok("swww", &["img", "--outputs", output, &display])?;
                }
                None => {
                    self.run_ok("swww", &["img", &display])?;
                }
            },
            DesktopEnv::Unsupported(name) => return Err(CoreError::EnvironmentUnsupported(name.clone())),
        }
        Ok(())
    }

    fn verify_background(&self, env: &DesktopEnv, monitor: Option<&str>) -> Result<Option<PathBuf>> {
        let reported = match env {
            DesktopEnv::Portal => {
                return match self.portal_session() {
                    Some(session) => self.verify_background(&session, monitor),
                    None => {
                        debug!("portal session has no readable desktop settings");
                        Ok(None)
                    }
                };
            }
            DesktopEnv::Gnome => {
                self.run_ok("gsettings", &["get", "org.gnome.desktop.background", "picture-uri"])?
            }
            DesktopEnv::Cinnamon => {
                self.run_ok("gsettings", &["get", "org.cinnamon.desktop.background", "picture-uri"])?
            }
            DesktopEnv::Mate => {
                self.run_ok("gsettings", &["get", "org.mate.background", "picture-filename"])?
            }
            DesktopEnv::Kde => {
                let script = "var ds = desktops(); for (var i = 0; i < ds.length; i++) { \
                    ds[i].currentConfigGroup = ['Wallpaper', 'org.kde.image', 'General']; \
                    print(ds[i].readConfig('Image') + '\\n'); }";
                let output = self.run_ok(
                    "qdbus",
                    &["org.kde.plasmashell", "/PlasmaShell", "org.kde.PlasmaShell.evaluateScript", script],
                )?;
                output.lines().find(|line| !line.trim().is_empty()).unwrap_or_default().to_string()
            }
            DesktopEnv::Xfce => {
                let properties = self.xfce_properties(monitor)?;
                let property = properties.first().map(String::as_str).unwrap_or_default();
                self.run_ok("xfconf-query", &["-c", "xfce4-desktop", "-p", property])?
            }
            DesktopEnv::Hyprland => {
                let listing = self.run_ok("hyprctl", &["hyprpaper", "listactive"])?;
                select_line(&listing, monitor, " = ")
            }
            DesktopEnv::Wlroots => {
                let listing = self.run_ok("swww", &["query"])?;
                select_line(&listing, monitor, "image: ")
            }
            DesktopEnv::Unsupported(name) => return Err(CoreError::EnvironmentUnsupported(name.clone())),
        };
        Ok(parse_reported_path(&reported))
    }
}

/// Value after `marker` on the line for `monitor`, or on the first line that has one.
fn select_line(listing: &str, monitor: Option<&str>, marker: &str) -> String {
    listing
        .lines()
        .filter(|line| monitor.is_none_or(|name| line.trim_start().starts_with(name)))
        .find_map(|line| line.split_once(marker).map(|(_, value)| value.trim().to_string()))
        .unwrap_or_default()
}

pub(crate) fn file_uri(path: &Path) -> String {
    format!("file://{}", utf8_percent_encode(&path.to_string_lossy(), URI_PATH))
}

/// Accepts `'file:///a%20b.jpg'`, `/a b.jpg`, and similar shapes reported by desktop tools.
pub(crate) fn parse_reported_path(raw: &str) -> Option<PathBuf> {
    let value = raw.trim().trim_matches(|c| c == '\'' || c == '"').trim();
    if value.is_empty() {
        return None;
    }
    match value.strip_prefix("file://") {
        Some(encoded) => Some(PathBuf::from(percent_decode_str(encoded).decode_utf8_lossy().into_owned())),
        None => Some(PathBuf::from(value)),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::apply::{ApplyRequest, WallpaperApplier};

    /// Replays canned outputs and records every invocation.
    #[derive(Debug, Default)]
    pub(crate) struct Scripted {
        pub calls: Mutex<Vec<String>>,
        pub replies: Mutex<VecDeque<Result<CommandOutput>>>,
    }

    impl CommandRunner for Arc<Scripted> {
        fn run(&self, program: &str, args: &[String], _timeout: Duration) -> Result<CommandOutput> {
            self.calls.lock().push(format!("{program} {}", args.join(" ")));
            self.replies.lock().pop_front().unwrap_or_else(|| Ok(ok("")))
        }
    }

    fn ok(stdout: &str) -> CommandOutput {
        CommandOutput { code: Some(0), stdout: stdout.to_string(), stderr: String::new() }
    }

    fn backend(script: &Arc<Scripted>) -> CommandBackend {
        session_backend(script, Some("GNOME"), DEFAULT_COMMAND_TIMEOUT)
    }

    fn session_backend(script: &Arc<Scripted>, desktop: Option<&'static str>, timeout: Duration) -> CommandBackend {
        CommandBackend::with_vars(
            Box::new(Arc::clone(script)),
            timeout,
            Box::new(move |key: &str| desktop.filter(|_| key == "XDG_CURRENT_DESKTOP").map(str::to_string)),
        )
    }

    #[test]
    fn portal_is_verified_through_the_session_settings() {
        let script = Arc::new(Scripted::default());
        script.replies.lock().extend([
            Ok(ok("(objectpath '/org/freedesktop/portal/desktop/request/1_1/t',)")),
            Ok(ok("'file:///tmp/w.jpg'\n")),
            Ok(ok("'file:///tmp/w.jpg'\n")),
        ]);
        let backend = backend(&script);

        backend.set_background(&DesktopEnv::Portal, Path::new("/tmp/w.jpg"), None).unwrap();
        let reported = backend.verify_background(&DesktopEnv::Portal, None).unwrap();
        assert_eq!(reported, Some(PathBuf::from("/tmp/w.jpg")));

        let calls = script.calls.lock();
        assert!(calls[0].contains("SetWallpaperURI"));
        assert!(calls[1].starts_with("gsettings get org.gnome.desktop.background picture-uri"));
        assert_eq!(calls.len(), 3);
    }

    #[test]
    fn portal_accepting_a_request_that_changes_nothing_fails_verification() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.jpg");
        std::fs::write(&path, b"jpeg").unwrap();

        for desktop in [Some("GNOME"), None] {
            let script = Arc::new(Scripted::default());
            let backend = session_backend(&script, desktop, Duration::from_millis(150));
            let applier = WallpaperApplier::new(Arc::new(backend)).with_override(Some(DesktopEnv::Portal));

            let err = applier.apply(&ApplyRequest::new(&path)).unwrap_err();
            assert_eq!(err, CoreError::ApplyVerificationFailed { expected: path.clone(), actual: None });
        }
    }

    #[test]
    fn uri_round_trips_through_desktop_quoting() {
        let path = Path::new("/home/me/Wall papers/a#1.jpg");
        let uri = file_uri(path);
        assert_eq!(uri, "file:///home/me/Wall%20papers/a%231.jpg");
        assert_eq!(parse_reported_path(&format!("'{uri}'\n")), Some(path.to_path_buf()));
        assert_eq!(parse_reported_path("''"), None);
    }

    #[test]
    fn gnome_sets_light_and_dark_uris_then_reads_back() {
        let script = Arc::new(Scripted::default());
        script.replies.lock().extend([Ok(ok("")), Ok(ok("")), Ok(ok("'file:///tmp/w.jpg'\n"))]);
        let backend = backend(&script);

        backend.set_background(&DesktopEnv::Gnome, Path::new("/tmp/w.jpg"), None).unwrap();
        let reported = backend.verify_background(&DesktopEnv::Gnome, None).unwrap();
        assert_eq!(reported, Some(PathBuf::from("/tmp/w.jpg")));

        let calls = script.calls.lock();
        assert!(calls[0].ends_with("picture-uri file:///tmp/w.jpg"));
        assert!(calls[1].contains("picture-uri-dark"));
        assert!(calls[2].starts_with("gsettings get"));
    }

    #[test]
    fn detection_probes_the_portal_first() {
        let script = Arc::new(Scripted::default());
        script.replies.lock().push_back(Ok(ok("interface org.freedesktop.portal.Wallpaper {")));
        assert_eq!(backend(&script).detect_environment(), DesktopEnv::Portal);

        let script = Arc::new(Scripted::default());
        script.replies.lock().push_back(Ok(CommandOutput { code: Some(1), ..ok("") }));
        assert_eq!(backend(&script).detect_environment(), DesktopEnv::Gnome);
    }

    #[test]
    fn non_zero_exit_is_a_command_failure() {
        let script = Arc::new(Scripted::default());
        script.replies.lock().push_back(Ok(CommandOutput {
            code: Some(2),
            stdout: String::new(),
            stderr: "no such output\n".into(),
        }));
        let err = backend(&script)
            .set_background(&DesktopEnv::Wlroots, Path::new("/tmp/w.png"), Some("DP-1"))
            .unwrap_err();
        assert_eq!(
            err,
            CoreError::ApplyCommandFailed {
                program: "swww".into(),
                status: "2".into(),
                stderr: "no such output".into(),
            }
        );
    }

    #[test]
    fn hyprpaper_listing_selects_the_monitor() {
        let listing = "DP-1 = /walls/a.png\nHDMI-A-1 = /walls/b.png\n";
        assert_eq!(select_line(listing, Some("HDMI-A-1"), " = "), "/walls/b.png");
        assert_eq!(select_line(listing, None, " = "), "/walls/a.png");
    }

    #[test]
    fn swww_query_reports_the_displayed_image() {
        let listing = "eDP-1: 1920x1080, scale: 1, currently displaying: image: /walls/c.jpg\n";
        assert_eq!(select_line(listing, None, "image: "), "/walls/c.jpg");
    }

    #[cfg(unix)]
    #[test]
    fn system_runner_collects_output_larger_than_a_pipe_buffer() {
        let script = "yes x | head -c 200000".to_string();
        let output = SystemRunner
            .run("sh", &["-c".to_string(), script], Duration::from_secs(10))
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.len(), 200_000);
    }

    #[cfg(unix)]
    #[test]
    fn system_runner_times_out_long_commands() {
        let err = SystemRunner
            .run("sleep", &["5".to_string()], Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, CoreError::Timeout { .. }));
        assert!(err.is_transient());
    }
}
