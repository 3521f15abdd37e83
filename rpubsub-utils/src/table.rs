use std::fmt::Write;

/// Plain-text table with per-column width caps. Cells wider than their cap are
/// wrapped, embedded newlines start a new line inside the same cell.
///
/// # Example:
/// ```
/// use rpubsub_utils::TextTable;
///
/// let mut t = TextTable::new(&[("#", 3), ("name", 10)]);
/// t.add_row(vec!["1".into(), "server1".into()]);
/// let s = t.render();
/// assert!(s.contains("| 1 | server1 |"));
/// ```
pub struct TextTable {
    columns: Vec<(String, usize)>,
    rows: Vec<Vec<String>>,
}

impl TextTable {
    pub fn new(columns: &[(&str, usize)]) -> Self {
        Self { columns: columns.iter().map(|(t, w)| (t.to_string(), (*w).max(1))).collect(), rows: Vec::new() }
    }

    /// Missing cells render empty, extra cells are ignored.
    #[inline]
    pub fn add_row(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn widths(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .map(|(i, (title, cap))| {
                self.rows
                    .iter()
                    .filter_map(|r| r.get(i))
                    .flat_map(|c| c.lines())
                    .map(|l| l.chars().count())
                    .chain(std::iter::once(title.chars().count()))
                    .max()
                    .unwrap_or_default()
                    .min(*cap)
            })
            .collect()
    }

    pub fn render(&self) -> String {
        let widths = self.widths();
        let sep = |c: char| -> String {
            let mut line = String::from("+");
            for w in widths.iter() {
                line.extend(std::iter::repeat(c).take(w + 2));
                line.push('+');
            }
            line.push('\n');
            line
        };

        let mut out = sep('-');
        let titles = self.columns.iter().map(|(t, _)| t.clone()).collect::<Vec<_>>();
        render_row(&mut out, &titles, &widths);
        out.push_str(&sep('='));
        for row in self.rows.iter() {
            render_row(&mut out, row, &widths);
            out.push_str(&sep('-'));
        }
        out
    }
}

fn wrap(text: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    for line in text.lines() {
        let chars = line.chars().collect::<Vec<_>>();
        if chars.is_empty() {
            lines.push(String::new());
        }
        for chunk in chars.chunks(width) {
            lines.push(chunk.iter().collect());
        }
    }
    if lines.is_empty() {
        lines.push(String::new());
    }
    lines
}

fn render_row(out: &mut String, cells: &[String], widths: &[usize]) {
    let wrapped = widths
        .iter()
        .enumerate()
        .map(|(i, w)| wrap(cells.get(i).map(String::as_str).unwrap_or_default(), *w))
        .collect::<Vec<_>>();
    let height = wrapped.iter().map(Vec::len).max().unwrap_or(1);
    for n in 0..height {
        out.push('|');
        for (lines, w) in wrapped.iter().zip(widths) {
            let line = lines.get(n).map(String::as_str).unwrap_or_default();
            let _ = write!(out, " {:<width$} |", line, width = *w);
        }
        out.push('\n');
    }
}
