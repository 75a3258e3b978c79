//! Capability table for the sandboxed document
//!
//! Each slot names a family of globals. A disabled slot is replaced by
//! no-op implementations in an init script that runs before any other code
//! in the sandbox, the rule engine included.

use serde::{Deserialize, Serialize};

/// Global that holds the engine's serialized result once it finishes
pub const RESULT_SENTINEL: &str = "__auditResult";
/// Global that holds the engine's error message if it fails
pub const ERROR_SENTINEL: &str = "__auditError";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    #[default]
    Disabled,
    Allowed,
}

impl Slot {
    pub fn is_disabled(&self) -> bool {
        matches!(self, Slot::Disabled)
    }
}

/// Named capability slots, all disabled by default
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CapabilityTable {
    /// alert / confirm / prompt / print
    pub dialogs: Slot,
    /// window.open
    pub popups: Slot,
    /// history manipulation and form submission
    pub navigation: Slot,
    /// setTimeout / setInterval
    pub timers: Slot,
    /// requestAnimationFrame / requestIdleCallback
    pub animation_frames: Slot,
    /// fetch / XMLHttpRequest / WebSocket / EventSource / sendBeacon
    pub network: Slot,
    /// console output and uncaught error propagation
    pub console: Slot,
}

const DIALOG_STUBS: &str = r#"
  stub(window, 'alert', function () {});
  stub(window, 'confirm', function () { return false; });
  stub(window, 'prompt', function () { return null; });
  stub(window, 'print', function () {});
"#;

const POPUP_STUBS: &str = r#"
  stub(window, 'open', function () { return null; });
"#;

const NAVIGATION_STUBS: &str = r#"
  ['pushState', 'replaceState', 'back', 'forward', 'go'].forEach(function (name) {
    stub(History.prototype, name, function () {});
  });
  stub(HTMLFormElement.prototype, 'submit', function () {});
  stub(HTMLFormElement.prototype, 'requestSubmit', function () {});
  window.addEventListener('submit', function (e) { e.preventDefault(); }, true);
  window.addEventListener('beforeunload', function (e) { e.preventDefault(); }, true);
"#;

const TIMER_STUBS: &str = r#"
  var nextTimer = 1;
  stub(window, 'setTimeout', function () { return nextTimer++; });
  stub(window, 'setInterval', function () { return nextTimer++; });
  stub(window, 'clearTimeout', function () {});
  stub(window, 'clearInterval', function () {});
"#;

const ANIMATION_FRAME_STUBS: &str = r#"
  var nextFrame = 1;
  stub(window, 'requestAnimationFrame', function () { return nextFrame++; });
  stub(window, 'cancelAnimationFrame', function () {});
  stub(window, 'requestIdleCallback', function () { return nextFrame++; });
  stub(window, 'cancelIdleCallback', function () {});
"#;

const NETWORK_STUBS: &str = r#"
  var refuse = function () { throw new TypeError('network access is disabled'); };
  stub(window, 'fetch', function () { return Promise.reject(new TypeError('network access is disabled')); });
  stub(window, 'XMLHttpRequest', refuse);
  stub(window, 'WebSocket', refuse);
  stub(window, 'EventSource', refuse);
  if (window.navigator) { stub(Navigator.prototype, 'sendBeacon', function () { return false; }); }
"#;

const CONSOLE_STUBS: &str = r#"
  ['log', 'info', 'warn', 'error', 'debug', 'trace', 'dir', 'table'].forEach(function (name) {
    stub(console, name, function () {});
  });
  window.addEventListener('error', function (e) { e.preventDefault(); e.stopImmediatePropagation(); }, true);
  window.addEventListener('unhandledrejection', function (e) { e.preventDefault(); }, true);
"#;

impl CapabilityTable {
    /// Every slot disabled
    pub fn locked_down() -> Self {
        Self::default()
    }

    pub fn disabled_slots(&self) -> Vec<&'static str> {
        [
            ("dialogs", self.dialogs),
            ("popups", self.popups),
            ("navigation", self.navigation),
            ("timers", self.timers),
            ("animation_frames", self.animation_frames),
            ("network", self.network),
            ("console", self.console),
        ]
        .into_iter()
        .filter(|(_, slot)| slot.is_disabled())
        .map(|(name, _)| name)
        .collect()
    }

    /// Render the table as a script that installs the no-op implementations
    ///
    /// The script is idempotent and also resets both sentinels.
    pub fn init_script(&self) -> String {
        let mut body = String::new();
        let sections = [
            (self.dialogs, DIALOG_STUBS),
            (self.popups, POPUP_STUBS),
            (self.navigation, NAVIGATION_STUBS),
            (self.timers, TIMER_STUBS),
            (self.animation_frames, ANIMATION_FRAME_STUBS),
            (self.network, NETWORK_STUBS),
            (self.console, CONSOLE_STUBS),
        ];
        for (slot, stubs) in sections {
            if slot.is_disabled() {
                body.push_str(stubs);
            }
        }

        format!(
            r#"(function () {{
  'use strict';
  var stub = function (target, name, impl) {{
    try {{
      Object.defineProperty(target, name, {{ value: impl, writable: false, configurable: false }});
    }} catch (e) {{
      try {{ target[name] = impl; }} catch (ignored) {{}}
    }}
  }};
{body}
  window.{result} = null;
  window.{error} = null;
}})();"#,
            body = body,
            result = RESULT_SENTINEL,
            error = ERROR_SENTINEL,
        )
    }
}
