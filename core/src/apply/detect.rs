//! Desktop environment identification from session variables.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Desktop environments the applier knows how to drive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesktopEnv {
    /// `org.freedesktop.portal.Wallpaper` over the session bus.
    Portal,
    Gnome,
    Cinnamon,
    Mate,
    Kde,
    Xfce,
    /// Hyprland with hyprpaper.
    Hyprland,
    /// Any wlroots compositor running swww.
    Wlroots,
    Unsupported(String),
}

impl DesktopEnv {
    pub fn name(&self) -> &str {
        match self {
            DesktopEnv::Portal => "portal",
            DesktopEnv::Gnome => "gnome",
            DesktopEnv::Cinnamon => "cinnamon",
            DesktopEnv::Mate => "mate",
            DesktopEnv::Kde => "kde",
            DesktopEnv::Xfce => "xfce",
            DesktopEnv::Hyprland => "hyprland",
            DesktopEnv::Wlroots => "wlroots",
            DesktopEnv::Unsupported(name) => name,
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, DesktopEnv::Unsupported(_))
    }
}

impl fmt::Display for DesktopEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn from_token(token: &str) -> Option<DesktopEnv> {
    let env = match token.trim().to_ascii_lowercase().as_str() {
        "gnome" | "gnome-xorg" | "gnome-classic" | "ubuntu" | "unity" | "pop" | "budgie" => {
            DesktopEnv::Gnome
        }
        "cinnamon" | "x-cinnamon" => DesktopEnv::Cinnamon,
        "mate" => DesktopEnv::Mate,
        "kde" | "plasma" | "plasmawayland" | "plasmax11" => DesktopEnv::Kde,
        "xfce" | "xfce4" | "xubuntu" => DesktopEnv::Xfce,
        "hyprland" => DesktopEnv::Hyprland,
        "sway" | "river" | "wayfire" | "niri" | "labwc" | "wlroots" => DesktopEnv::Wlroots,
        _ => return None,
    };
    Some(env)
}

/// Pick the environment from session variables. A reachable wallpaper portal wins over any
/// desktop-specific backend.
pub fn detect_from<F>(var: F, portal_available: bool) -> DesktopEnv
where
    F: Fn(&str) -> Option<String>,
{
    if portal_available {
        return DesktopEnv::Portal;
    }

    let current = var("XDG_CURRENT_DESKTOP").unwrap_or_default();
    if let Some(env) = current.split(':').find_map(from_token) {
        return env;
    }
    if var("HYPRLAND_INSTANCE_SIGNATURE").is_some() {
        return DesktopEnv::Hyprland;
    }
    if var("SWAYSOCK").is_some() {
        return DesktopEnv::Wlroots;
    }
    let session = var("DESKTOP_SESSION").unwrap_or_default();
    if let Some(env) = from_token(&session) {
        return env;
    }

    let name = [current, session].into_iter().find(|value| !value.trim().is_empty());
    DesktopEnv::Unsupported(name.unwrap_or_else(|| "unknown".to_string()))
}
