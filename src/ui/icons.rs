//! Icons shared by the terminal output, with plain fallbacks.

use console::Emoji;

pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK] ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR] ");
pub static STOP: Emoji<'_, '_> = Emoji("🛑 ", "[STOP] ");
pub static THINKING: Emoji<'_, '_> = Emoji("💭 ", "~ ");
pub static TOOL: Emoji<'_, '_> = Emoji("🔧 ", "> ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "! ");
pub static PHASE: Emoji<'_, '_> = Emoji("▶️  ", "== ");
