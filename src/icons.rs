//! Icon name defaults and state colours for entity widgets
//!
//! Only icon *names* (Material Design Icons ids without the `mdi:` prefix)
//! live here; turning a name into path data is the renderer's job.

/// Icon used when neither device class nor domain has a mapping
pub const FALLBACK_ICON: &str = "circle-outline";

const COLOR_ON: &str = "#FFC107";
const COLOR_OFF: &str = "#888888";
const COLOR_UNAVAILABLE: &str = "#555555";

fn device_class_icon(device_class: &str) -> Option<&'static str> {
    Some(match device_class {
        "temperature" => "thermometer",
        "humidity" => "water-percent",
        "pressure" => "gauge",
        "power" => "lightning-bolt",
        "energy" => "flash",
        "battery" => "battery",
        "signal_strength" => "signal",
        "illuminance" => "lightbulb-on",
        "motion" => "motion-sensor",
        "door" => "door",
        "window" => "window-open",
        "smoke" => "smoke-detector",
        "co" => "smoke-detector-variant",
        "tamper" => "security",
        _ => return None,
    })
}

fn domain_icon(domain: &str) -> Option<&'static str> {
    Some(match domain {
        "camera" => "camera",
        "light" => "lightbulb",
        "switch" => "toggle-switch",
        "lock" => "lock",
        "cover" => "window-shutter",
        "climate" => "thermostat",
        "fan" => "fan",
        "sensor" | "binary_sensor" => "radar",
        "device_tracker" => "cellphone",
        "person" => "account",
        "sun" => "weather-sunny",
        "weather" => "weather-cloudy",
        _ => return None,
    })
}

/// Default icon: device class first, then domain, then the fallback
pub fn default_icon(domain: &str, device_class: Option<&str>) -> &'static str {
    device_class
        .and_then(device_class_icon)
        .or_else(|| domain_icon(domain))
        .unwrap_or(FALLBACK_ICON)
}

/// Strip the `mdi:` prefix from a hub-provided icon attribute
pub fn normalize_icon(icon: &str) -> Option<String> {
    let name = icon.trim().trim_start_matches("mdi:");
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Icon colour for an entity state, honouring per-widget overrides
///
/// Unavailable/unknown always render dark gray, overrides don't apply.
pub fn icon_color<'a>(state: Option<&str>, color_on: Option<&'a str>, color_off: Option<&'a str>) -> &'a str {
    let Some(state) = state.filter(|s| !s.is_empty()) else {
        return color_off.unwrap_or(COLOR_OFF);
    };
    match state.to_ascii_lowercase().as_str() {
        "unavailable" | "unknown" => COLOR_UNAVAILABLE,
        "on" => color_on.unwrap_or(COLOR_ON),
        _ => color_off.unwrap_or(COLOR_OFF),
    }
}
