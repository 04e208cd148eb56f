//! Synthetic-id migration
//!
//! A widget copied from the palette is keyed by a negative token until the
//! surface reports the entity it stands for. Migration folds the token's
//! record into the canonical one and drops the token.

use crate::data::{is_synthetic_id, Widget};
use crate::persistence::Collection;

/// Copy fields the canonical record lacks from the synthetic one
fn fill_missing(canonical: &mut Widget, synthetic: Widget) {
    fn fill<T>(slot: &mut Option<T>, from: Option<T>) {
        if slot.is_none() {
            *slot = from;
        }
    }
    fill(&mut canonical.position, synthetic.position);
    fill(&mut canonical.size, synthetic.size);
    fill(&mut canonical.icon, synthetic.icon);
    fill(&mut canonical.tap_action, synthetic.tap_action);
    fill(&mut canonical.hold_action, synthetic.hold_action);
    fill(&mut canonical.hub_action, synthetic.hub_action);
    fill(&mut canonical.label_name, synthetic.label_name);
    fill(&mut canonical.label_visible, synthetic.label_visible);
    fill(&mut canonical.state_visible, synthetic.state_visible);
    fill(&mut canonical.value_prefix, synthetic.value_prefix);
    fill(&mut canonical.value_suffix, synthetic.value_suffix);
    fill(&mut canonical.icon_color_on, synthetic.icon_color_on);
    fill(&mut canonical.icon_color_off, synthetic.icon_color_off);
}

/// Re-key `synthetic` to `canonical`; false (and untouched) when there is
/// nothing to migrate
pub fn migrate(widgets: &mut Collection, synthetic: &str, canonical: &str) -> bool {
    if synthetic == canonical || !is_synthetic_id(synthetic) || is_synthetic_id(canonical) {
        return false;
    }
    let Some(record) = widgets.remove(synthetic) else {
        return false;
    };

    let target = widgets
        .entry(canonical.to_string())
        .or_insert_with(|| Widget::new(canonical));
    fill_missing(target, record);
    true
}

/// Ids still waiting for resolution
pub fn synthetic_ids(widgets: &Collection) -> Vec<String> {
    widgets
        .keys()
        .filter(|id| is_synthetic_id(id))
        .cloned()
        .collect()
}
