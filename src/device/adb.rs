use async_trait::async_trait;
use base64::Engine as _;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::OnceCell;

use super::{Device, DeviceError};
use crate::snapshot::{DeviceSnapshot, Point, Resolution};

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
const PNG_MAGIC: &[u8] = b"\x89PNG";

/// ADBKeyboard input method, which accepts text broadcasts in any script.
const ADB_KEYBOARD_IME: &str = "com.android.adbkeyboard/.AdbIME";

/// Phrases adb prints when the transport, not the command, is the problem.
const TRANSPORT_FAILURES: &[&str] = &[
    "no devices/emulators found",
    "device offline",
    "device unauthorized",
    "unauthorized",
    "not found",
    "cannot connect",
    "connection refused",
    "closed",
];

/// A phone reached through the `adb` command-line tool.
pub struct AdbDevice {
    serial: String,
    command_timeout: Duration,
    resolution: OnceCell<Resolution>,
    adb_keyboard: OnceCell<bool>,
}

impl AdbDevice {
    /// Connect to `serial`, or to the first online device when none is given.
    pub async fn connect(serial: Option<&str>) -> Result<Self, DeviceError> {
        let serial = match serial {
            Some(s) => s.to_string(),
            None => {
                let listing = run_adb(&["devices"], DEFAULT_COMMAND_TIMEOUT).await?;
                let online = parse_device_list(&String::from_utf8_lossy(&listing));
                online
                    .into_iter()
                    .next()
                    .ok_or_else(|| DeviceError::Unreachable("no devices/emulators found".into()))?
            }
        };

        tracing::info!(%serial, "Connecting to device");
        let device = Self {
            serial,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            resolution: OnceCell::new(),
            adb_keyboard: OnceCell::new(),
        };

        let state = device.adb(&["get-state"]).await?;
        let state = String::from_utf8_lossy(&state);
        if state.trim() != "device" {
            return Err(DeviceError::Unreachable(format!(
                "{} is in state {:?}",
                device.serial,
                state.trim()
            )));
        }

        device.lock_portrait().await;
        let resolution = device.resolution().await?;
        tracing::info!(serial = %device.serial, %resolution, "Device connected");
        Ok(device)
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Bring the app to the foreground through its launcher intent.
    pub async fn launch_app(&self, package: &str) -> Result<(), DeviceError> {
        tracing::info!(%package, "Launching app");
        self.shell(&[
            "monkey",
            "-p",
            package,
            "-c",
            "android.intent.category.LAUNCHER",
            "1",
        ])
        .await?;
        Ok(())
    }

    /// Coordinates only hold in portrait, so auto-rotation is switched off.
    async fn lock_portrait(&self) {
        let current = match self
            .shell(&["settings", "get", "system", "accelerometer_rotation"])
            .await
        {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "Could not read rotation setting");
                return;
            }
        };

        if current.trim() != "1" {
            tracing::debug!("Screen rotation already locked");
            return;
        }

        tracing::warn!("Auto-rotation is enabled, locking to portrait");
        let locked = async {
            self.shell(&["settings", "put", "system", "accelerometer_rotation", "0"])
                .await?;
            self.shell(&["settings", "put", "system", "user_rotation", "0"])
                .await
        }
        .await;
        if let Err(e) = locked {
            tracing::warn!(error = %e, "Could not lock rotation; coordinate strategies may misfire");
        }
    }

    async fn has_adb_keyboard(&self) -> bool {
        *self
            .adb_keyboard
            .get_or_init(|| async {
                match self.shell(&["ime", "list", "-s"]).await {
                    Ok(list) => list.lines().any(|l| l.trim() == ADB_KEYBOARD_IME),
                    Err(e) => {
                        tracing::warn!(error = %e, "Could not list input methods");
                        false
                    }
                }
            })
            .await
    }

    /// Send base64 text through ADBKeyboard, then restore the user's IME.
    async fn broadcast_text(&self, encoded: &str) -> Result<(), DeviceError> {
        let previous = self
            .shell(&["settings", "get", "secure", "default_input_method"])
            .await?
            .trim()
            .to_string();
        let switch = previous != ADB_KEYBOARD_IME;
        if switch {
            self.shell(&["ime", "set", ADB_KEYBOARD_IME]).await?;
        }

        let sent = self
            .shell(&["am", "broadcast", "-a", "ADB_INPUT_B64", "--es", "msg", encoded])
            .await;

        if switch && !previous.is_empty() && previous != "null" {
            if let Err(e) = self.shell(&["ime", "set", &previous]).await {
                tracing::warn!(ime = %previous, error = %e, "Could not restore input method");
            }
        }
        sent.map(|_| ())
    }

    async fn adb(&self, args: &[&str]) -> Result<Vec<u8>, DeviceError> {
        let mut full = vec!["-s", self.serial.as_str()];
        full.extend_from_slice(args);
        run_adb(&full, self.command_timeout).await
    }

    async fn shell(&self, args: &[&str]) -> Result<String, DeviceError> {
        let mut full = vec!["shell"];
        full.extend_from_slice(args);
        let out = self.adb(&full).await?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

#[async_trait]
impl Device for AdbDevice {
    async fn snapshot(&self) -> Result<DeviceSnapshot, DeviceError> {
        let resolution = self.resolution().await?;
        let raw = self
            .adb(&["exec-out", "uiautomator", "dump", "/dev/tty"])
            .await?;
        DeviceSnapshot::from_hierarchy_xml(&String::from_utf8_lossy(&raw), resolution)
            .map_err(DeviceError::Hierarchy)
    }

    async fn resolution(&self) -> Result<Resolution, DeviceError> {
        self.resolution
            .get_or_try_init(|| async {
                let out = self.shell(&["wm", "size"]).await?;
                parse_wm_size(&out).ok_or_else(|| {
                    DeviceError::Command(format!("unexpected `wm size` output: {:?}", out.trim()))
                })
            })
            .await
            .copied()
    }

    async fn tap(&self, at: Point) -> Result<(), DeviceError> {
        tracing::debug!(x = at.x, y = at.y, "adb tap");
        self.shell(&["input", "tap", &at.x.to_string(), &at.y.to_string()])
            .await?;
        Ok(())
    }

    async fn type_text(&self, text: &str) -> Result<(), DeviceError> {
        let unicode = !normalize_text(text).is_ascii() && self.has_adb_keyboard().await;
        for input in plan_text_input(text, unicode)? {
            match input {
                TextInput::Typed(escaped) => {
                    self.shell(&["input", "text", &escaped]).await?;
                }
                TextInput::Enter => {
                    self.shell(&["input", "keyevent", "KEYCODE_ENTER"]).await?;
                }
                TextInput::Broadcast(encoded) => self.broadcast_text(&encoded).await?,
            }
        }
        Ok(())
    }

    async fn swipe(&self, from: Point, to: Point, duration: Duration) -> Result<(), DeviceError> {
        let ms = duration.as_millis().to_string();
        self.shell(&[
            "input",
            "swipe",
            &from.x.to_string(),
            &from.y.to_string(),
            &to.x.to_string(),
            &to.y.to_string(),
            &ms,
        ])
        .await?;
        Ok(())
    }

    async fn press_back(&self) -> Result<(), DeviceError> {
        self.shell(&["input", "keyevent", "KEYCODE_BACK"]).await?;
        Ok(())
    }

    async fn screenshot(&self) -> Result<Vec<u8>, DeviceError> {
        let png = self.adb(&["exec-out", "screencap", "-p"]).await?;
        if !png.starts_with(PNG_MAGIC) {
            return Err(DeviceError::Command("screencap did not return a PNG".into()));
        }
        Ok(png)
    }
}

async fn run_adb(args: &[&str], timeout: Duration) -> Result<Vec<u8>, DeviceError> {
    let mut cmd = Command::new("adb");
    cmd.args(args).kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Err(_) => return Err(DeviceError::Timeout(timeout)),
        Ok(Err(e)) => return Err(DeviceError::Unreachable(format!("failed to run adb: {e}"))),
        Ok(Ok(output)) => output,
    };

    let stderr = String::from_utf8_lossy(&output.stderr);
    if is_transport_failure(&stderr) {
        return Err(DeviceError::Unreachable(stderr.trim().to_string()));
    }
    if !output.status.success() {
        return Err(DeviceError::Command(format!(
            "adb {} exited with {}: {}",
            args.join(" "),
            output.status,
            stderr.trim()
        )));
    }
    Ok(output.stdout)
}

fn is_transport_failure(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    (lower.starts_with("error:") && TRANSPORT_FAILURES.iter().any(|p| lower.contains(p)))
        || lower.contains("no devices/emulators found")
}

/// Serials in state `device` from `adb devices` output.
fn parse_device_list(output: &str) -> Vec<String> {
    output
        .lines()
        .skip_while(|l| !l.starts_with("List of devices"))
        .skip(1)
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            match (cols.next(), cols.next()) {
                (Some(serial), Some("device")) => Some(serial.to_string()),
                _ => None,
            }
        })
        .collect()
}

/// `Override size` wins over `Physical size` when both are present.
fn parse_wm_size(output: &str) -> Option<Resolution> {
    let find = |prefix: &str| {
        output
            .lines()
            .find_map(|l| l.trim().strip_prefix(prefix))
            .and_then(|v| v.trim().parse().ok())
    };
    find("Override size:").or_else(|| find("Physical size:"))
}

/// One shell command's worth of text entry.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TextInput {
    /// Escaped argument for `input text`.
    Typed(String),
    Enter,
    /// Base64 payload for ADBKeyboard.
    Broadcast(String),
}

/// Tabs become spaces, `\r\n` becomes `\n`, other control characters go.
fn normalize_text(text: &str) -> String {
    text.replace("\r\n", "\n")
        .chars()
        .filter_map(|c| match c {
            '\n' => Some('\n'),
            '\t' => Some(' '),
            c if c.is_control() => None,
            c => Some(c),
        })
        .collect()
}

/// ASCII goes through `input text` line by line with Enter key events in
/// between, so no line break ever reaches the device shell. Anything else
/// needs ADBKeyboard, which receives the text base64-encoded.
fn plan_text_input(text: &str, adb_keyboard: bool) -> Result<Vec<TextInput>, DeviceError> {
    let text = normalize_text(text);
    if !text.is_ascii() {
        if !adb_keyboard {
            return Err(DeviceError::Command(format!(
                "non-ASCII text needs the ADBKeyboard input method ({ADB_KEYBOARD_IME})"
            )));
        }
        let encoded = base64::engine::general_purpose::STANDARD.encode(text.as_bytes());
        return Ok(vec![TextInput::Broadcast(encoded)]);
    }

    let mut plan = Vec::new();
    for (i, line) in text.split('\n').enumerate() {
        if i > 0 {
            plan.push(TextInput::Enter);
        }
        if !line.is_empty() {
            plan.push(TextInput::Typed(escape_input_text(line)));
        }
    }
    Ok(plan)
}

/// `input text` splits on spaces and runs through the device shell.
fn escape_input_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len() * 2);
    for c in text.chars() {
        match c {
            ' ' => out.push_str("%s"),
            '\\' | '\'' | '"' | '(' | ')' | '&' | '<' | '>' | ';' | '|' | '*' | '~' | '$' | '`'
            | '?' | '!' | '#' | '%' | '[' | ']' | '{' | '}' => {
                out.push('\\');
                out.push(c);
            }
            c if c.is_control() => {}
            _ => out.push(c),
        }
    }
    out
}
