pub mod icons;
pub mod output;
pub mod table;
pub mod theme;

pub use icons::Icons;
pub use output::{error, header, hint, info, section, success, warn};
pub use table::{card_table, stats_table, CardRow};
pub use theme::{err_theme, theme, Theme};
