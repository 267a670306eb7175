#[path = "../src/student_id.rs"]
mod student_id;

#[test]
fn next_code_follows_highest_numeric_suffix() {
    let existing = ["IGCSE-05-001", "IGCSE-05-003", "IGCSE-05-BAD"];
    assert_eq!(
        student_id::next_student_id("IGCSE", "5", &existing),
        "IGCSE-05-004"
    );
}

#[test]
fn first_code_for_a_pair_is_001() {
    let none: [&str; 0] = [];
    assert_eq!(student_id::next_student_id("CBSE", "10", &none), "CBSE-10-001");
}

#[test]
fn codes_of_other_pairs_are_ignored() {
    let existing = vec![
        "CBSE-05-009".to_string(),
        "IGCSE-06-004".to_string(),
        "IGCSE-05-002".to_string(),
        "IGCSE-5-007".to_string(),
    ];
    assert_eq!(
        student_id::next_student_id("igcse", "5", &existing),
        "IGCSE-05-003"
    );
}

#[test]
fn sequence_grows_past_three_digits() {
    let existing = ["SSC-08-999"];
    assert_eq!(student_id::next_student_id("SSC", "8", &existing), "SSC-08-1000");
}
