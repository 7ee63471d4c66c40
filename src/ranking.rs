use std::cmp::Ordering;

use crate::models::{round2, MarkRanking, PublishedMark, RankedStudent, Student};

pub const ANONYMOUS_NAME: &str = "Anonymous";

/// `first-name.last-name@school` becomes `First Name LAST NAME`.
pub fn name_from_email(email: &str) -> String {
    let local = email.split('@').next().unwrap_or(email);
    let (first, last) = local.split_once('.').unwrap_or((local, ""));

    let firsts: Vec<String> = first
        .split('-')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(head) => head.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect();

    let lasts = last.replace(['-', '.'], " ").to_uppercase();
    format!("{} {}", firsts.join(" "), lasts).trim().to_string()
}

pub fn display_name(student: &Student) -> String {
    if student.anonymous {
        ANONYMOUS_NAME.to_string()
    } else {
        name_from_email(&student.email)
    }
}

/// Published marks the student has not filed yet, absences included as filed.
pub fn missing_marks<'a>(published: &'a [PublishedMark], student: &Student) -> Vec<&'a PublishedMark> {
    published
        .iter()
        .filter(|mark| student.mark(&mark.id).is_none())
        .collect()
}

fn has_filed_everything(published: &[PublishedMark], student: &Student) -> bool {
    missing_marks(published, student).is_empty()
}

fn rank<F>(students: &[Student], mut value: F) -> Vec<RankedStudent>
where
    F: FnMut(&Student) -> Option<f64>,
{
    let mut entries: Vec<RankedStudent> = students
        .iter()
        .filter_map(|student| {
            value(student).map(|value| RankedStudent {
                student_id: student.id,
                display_name: display_name(student),
                value,
            })
        })
        .collect();

    entries.sort_by(|a, b| b.value.partial_cmp(&a.value).unwrap_or(Ordering::Equal));
    entries
}

/// Students who filed every published mark, by general average.
pub fn general_ranking(students: &[Student], published: &[PublishedMark]) -> Vec<RankedStudent> {
    rank(students, |student| {
        has_filed_everything(published, student)
            .then_some(student.averages.general)
            .flatten()
    })
}

/// Students who filed every published mark, by the average of one unit.
pub fn unit_ranking(
    students: &[Student],
    published: &[PublishedMark],
    unit_id: &str,
) -> Vec<RankedStudent> {
    rank(students, |student| {
        has_filed_everything(published, student)
            .then(|| student.averages.unit_average(unit_id))
            .flatten()
    })
}

/// Students holding a graded value for one mark, with the population mean.
pub fn mark_ranking(students: &[Student], mark_id: &str) -> MarkRanking {
    let entries = rank(students, |student| {
        student
            .mark(mark_id)
            .filter(|mark| !mark.is_absent())
            .map(|mark| mark.value)
    });

    let promotion_mean = (!entries.is_empty()).then(|| {
        round2(entries.iter().map(|entry| entry.value).sum::<f64>() / entries.len() as f64)
    });

    MarkRanking {
        mark_id: mark_id.to_string(),
        entries,
        promotion_mean,
    }
}

pub fn position(ranking: &[RankedStudent], student: &Student) -> Option<usize> {
    ranking
        .iter()
        .position(|entry| entry.student_id == student.id)
        .map(|index| index + 1)
}
