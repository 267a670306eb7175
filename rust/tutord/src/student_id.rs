/// `{BOARD}-{GRADE}-` with the board uppercased and the grade left-padded
/// with zeros to two characters.
pub fn code_prefix(board: &str, grade: &str) -> String {
    format!(
        "{}-{:0>2}-",
        board.trim().to_uppercase(),
        grade.trim().to_uppercase()
    )
}

/// Next sequential student code for a (board, grade) pair. Existing codes
/// whose suffix is not an integer, or is too large to increment, are ignored.
pub fn next_student_id<S: AsRef<str>>(board: &str, grade: &str, existing: &[S]) -> String {
    let prefix = code_prefix(board, grade);
    let next_seq = existing
        .iter()
        .filter_map(|id| id.as_ref().trim().strip_prefix(prefix.as_str()))
        .filter_map(|suffix| suffix.parse::<u64>().ok()?.checked_add(1))
        .max()
        .unwrap_or(1);
    format!("{}{:03}", prefix, next_seq)
}
