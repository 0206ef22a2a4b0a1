//! Terminal output helpers for the command layer.

use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL_CONDENSED;
use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table};
use dialoguer::console::{style, StyledObject};

pub(crate) fn brand_bold<D>(value: D) -> StyledObject<D> {
    style(value).cyan().bold()
}

pub(crate) fn muted<D>(value: D) -> StyledObject<D> {
    style(value).dim()
}

pub(crate) fn success<D>(value: D) -> StyledObject<D> {
    style(value).green()
}

pub(crate) fn warning<D>(value: D) -> StyledObject<D> {
    style(value).yellow()
}

pub(crate) fn error<D>(value: D) -> StyledObject<D> {
    style(value).red().bold()
}

macro_rules! out_info {
    ($($arg:tt)*) => {
        println!("{} {}", $crate::output::muted("·"), format!($($arg)*))
    };
}

macro_rules! out_success {
    ($($arg:tt)*) => {
        println!("{} {}", $crate::output::success("✓"), format!($($arg)*))
    };
}

macro_rules! out_warn {
    ($($arg:tt)*) => {
        eprintln!("{} {}", $crate::output::warning("!"), format!($($arg)*))
    };
}

macro_rules! out_error {
    ($($arg:tt)*) => {
        eprintln!("{} {}", $crate::output::error("✗"), format!($($arg)*))
    };
}

pub(crate) use {out_error, out_info, out_success, out_warn};

/// Rounded table with a bold cyan header. Cells may carry console styling;
/// widths are measured without the escape codes.
pub(crate) struct Columns {
    table: Table,
}

impl Columns {
    pub(crate) fn new() -> Self {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL_CONDENSED)
            .apply_modifier(UTF8_ROUND_CORNERS)
            .set_content_arrangement(ContentArrangement::Dynamic);
        Self { table }
    }

    pub(crate) fn header<I, S>(mut self, cells: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.table.set_header(cells.into_iter().map(|cell| {
            Cell::new(cell.into())
                .fg(Color::Cyan)
                .add_attribute(Attribute::Bold)
        }));
        self
    }

    pub(crate) fn row<I, S>(mut self, cells: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.table
            .add_row(cells.into_iter().map(|cell| Cell::new(cell.into())));
        self
    }

    pub(crate) fn render(&self) -> String {
        self.table.to_string()
    }

    pub(crate) fn print(&self) {
        println!("{}", self.render());
    }
}
