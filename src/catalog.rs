use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::LazyLock;

pub const CATEGORY_EXACT_SCIENCES: &str = "Exatas";
pub const CATEGORY_HUMANITIES: &str = "Humanas";
pub const CATEGORY_LANGUAGES: &str = "Linguagens";
pub const CATEGORY_OTHER: &str = "Outras";

static EXACT_SCIENCES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"matem[aá]tica|f[ií]sica|qu[ií]mica|ci[êe]ncias?|biologia").unwrap()
});
static HUMANITIES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"hist[oó]ria|geografia|filosofia|sociologia|ensino religioso").unwrap()
});
static LANGUAGES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"portugu[êe]s|ingl[êe]s|espanhol|literatura|reda[çc][ãa]o|l[ií]ngua|artes?")
        .unwrap()
});

// Buckets are checked in this fixed order and the first match wins, so a
// name whose keywords land in several buckets resolves to the earliest one.
// "Educação Física" matches the exact-sciences "física" keyword and
// classifies as Exatas; long-standing catalog behavior, kept.
fn category_rules() -> [(&'static LazyLock<Regex>, &'static str); 3] {
    [
        (&EXACT_SCIENCES, CATEGORY_EXACT_SCIENCES),
        (&HUMANITIES, CATEGORY_HUMANITIES),
        (&LANGUAGES, CATEGORY_LANGUAGES),
    ]
}

/// Stored category wins verbatim; otherwise the name is classified by the
/// ordered keyword buckets, falling back to "Outras".
pub fn effective_category(name: &str, stored: Option<&str>) -> String {
    if let Some(stored) = stored {
        if !stored.trim().is_empty() {
            return stored.to_string();
        }
    }
    let lowered = name.to_lowercase();
    for (pattern, category) in category_rules() {
        if pattern.is_match(&lowered) {
            return category.to_string();
        }
    }
    CATEGORY_OTHER.to_string()
}

#[derive(Debug, Clone)]
pub struct Subject {
    pub id: String,
    pub code: String,
    pub name: String,
    pub category: Option<String>,
}

impl Subject {
    pub fn effective_category(&self) -> String {
        effective_category(&self.name, self.category.as_deref())
    }
}

fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

// Same name (case- and whitespace-insensitive) AND same effective category,
// excluding the subject being edited.
pub fn is_duplicate(
    existing: &[Subject],
    name: &str,
    category: Option<&str>,
    exclude_id: Option<&str>,
) -> bool {
    let candidate_name = normalize_name(name);
    let candidate_category = effective_category(name, category);
    existing.iter().any(|s| {
        if exclude_id == Some(s.id.as_str()) {
            return false;
        }
        normalize_name(&s.name) == candidate_name && s.effective_category() == candidate_category
    })
}

// Teacher ids come from the outer auth layer and are opaque here.
#[derive(Debug, Clone)]
pub struct TeachingLink {
    pub id: String,
    pub teacher_id: String,
    pub subject_id: String,
    pub class_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectClassRow {
    pub subject_id: String,
    pub code: String,
    pub name: String,
    pub class_id: String,
}

// The subject-per-class view is derived from the link table, never stored
// on Subject. One row per distinct (subject, class) pair; subjects with no
// link produce no rows, links pointing at unknown subjects are dropped.
pub fn class_join_view(
    subjects: &[Subject],
    links: &[TeachingLink],
    class_filter: Option<&HashSet<String>>,
) -> Vec<SubjectClassRow> {
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut out = Vec::new();
    for link in links {
        if let Some(filter) = class_filter {
            if !filter.contains(&link.class_id) {
                continue;
            }
        }
        let Some(subject) = subjects.iter().find(|s| s.id == link.subject_id) else {
            continue;
        };
        if !seen.insert((link.subject_id.clone(), link.class_id.clone())) {
            continue;
        }
        out.push(SubjectClassRow {
            subject_id: subject.id.clone(),
            code: subject.code.clone(),
            name: subject.name.clone(),
            class_id: link.class_id.clone(),
        });
    }
    out
}

pub fn filter_subjects(
    subjects: &[Subject],
    search: &str,
    category: Option<&str>,
) -> Vec<Subject> {
    let needle = search.trim().to_lowercase();
    subjects
        .iter()
        .filter(|s| {
            let name_ok = needle.is_empty() || s.name.to_lowercase().contains(&needle);
            let category_ok = category
                .map(|c| s.effective_category() == c)
                .unwrap_or(true);
            name_ok && category_ok
        })
        .cloned()
        .collect()
}

// Classic offset/limit. Pages are 1-based; a page past the end is empty,
// not an error.
pub fn paginate<T: Clone>(items: &[T], page: usize, page_size: usize) -> (usize, Vec<T>) {
    if page_size == 0 {
        return (0, Vec::new());
    }
    let total_pages = items.len().div_ceil(page_size);
    let page = page.max(1);
    let start = (page - 1).saturating_mul(page_size);
    if start >= items.len() {
        return (total_pages, Vec::new());
    }
    let end = (start + page_size).min(items.len());
    (total_pages, items[start..end].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject(id: &str, name: &str, category: Option<&str>) -> Subject {
        Subject {
            id: id.to_string(),
            code: format!("{}1", id.to_uppercase()),
            name: name.to_string(),
            category: category.map(|c| c.to_string()),
        }
    }

    fn link(id: &str, teacher: &str, subject: &str, class: &str) -> TeachingLink {
        TeachingLink {
            id: id.to_string(),
            teacher_id: teacher.to_string(),
            subject_id: subject.to_string(),
            class_id: class.to_string(),
        }
    }

    #[test]
    fn infers_categories_from_keywords() {
        assert_eq!(effective_category("Matemática", None), "Exatas");
        assert_eq!(effective_category("História do Brasil", None), "Humanas");
        assert_eq!(effective_category("Língua Portuguesa", None), "Linguagens");
        assert_eq!(effective_category("Robótica", None), "Outras");
    }

    #[test]
    fn physical_education_lands_in_exact_sciences() {
        // "física" is an exact-sciences keyword and that bucket is checked
        // first; the catalog has always classified this name this way.
        assert_eq!(effective_category("Educação Física", None), "Exatas");
    }

    #[test]
    fn first_matching_bucket_wins_on_overlap() {
        assert_eq!(effective_category("Química e História", None), "Exatas");
        assert_eq!(effective_category("História da Literatura", None), "Humanas");
    }

    #[test]
    fn stored_category_wins_verbatim() {
        assert_eq!(
            effective_category("Matemática", Some("Eletivas")),
            "Eletivas"
        );
        // Blank override falls through to inference.
        assert_eq!(effective_category("Matemática", Some("  ")), "Exatas");
    }

    #[test]
    fn duplicate_detection_ignores_case_and_whitespace() {
        let existing = vec![subject("mat", "Matemática", None)];
        assert!(is_duplicate(&existing, "  matemática ", None, None));
        assert!(is_duplicate(&existing, "MATEMÁTICA", None, None));
        // Same name under a different effective category is allowed.
        assert!(!is_duplicate(&existing, "Matemática", Some("Eletivas"), None));
        // Editing the subject itself is not a duplicate.
        assert!(!is_duplicate(&existing, "Matemática", None, Some("mat")));
    }

    #[test]
    fn join_view_is_link_driven_and_distinct() {
        let subjects = vec![
            subject("mat", "Matemática", None),
            subject("por", "Português", None),
            subject("orphan", "Sem Turma", None),
        ];
        let links = vec![
            link("l1", "p1", "mat", "t1"),
            link("l2", "p2", "mat", "t1"), // second teacher, same pair
            link("l3", "p1", "mat", "t2"),
            link("l4", "p1", "por", "t1"),
            link("l5", "p1", "ghost", "t1"), // unknown subject dropped
        ];

        let all = class_join_view(&subjects, &links, None);
        assert_eq!(all.len(), 3);
        assert!(all
            .iter()
            .any(|r| r.subject_id == "mat" && r.class_id == "t2"));
        assert!(!all.iter().any(|r| r.subject_id == "orphan"));

        let only_t1: HashSet<String> = ["t1".to_string()].into_iter().collect();
        let filtered = class_join_view(&subjects, &links, Some(&only_t1));
        assert_eq!(filtered.len(), 2);
        assert!(filtered.iter().all(|r| r.class_id == "t1"));
    }

    #[test]
    fn search_and_category_filters_compose() {
        let subjects = vec![
            subject("mat", "Matemática", None),
            subject("fis", "Física", None),
            subject("his", "História", None),
        ];
        let hits = filter_subjects(&subjects, "mat", None);
        assert_eq!(hits.len(), 1);

        let exatas = filter_subjects(&subjects, "", Some("Exatas"));
        assert_eq!(exatas.len(), 2);

        let both = filter_subjects(&subjects, "fís", Some("Exatas"));
        assert_eq!(both.len(), 1);
        assert_eq!(both[0].id, "fis");
    }

    #[test]
    fn pagination_rounds_total_pages_up() {
        let items: Vec<i32> = (1..=7).collect();
        let (pages, first) = paginate(&items, 1, 3);
        assert_eq!(pages, 3);
        assert_eq!(first, vec![1, 2, 3]);
        let (_, last) = paginate(&items, 3, 3);
        assert_eq!(last, vec![7]);
        let (_, past_end) = paginate(&items, 4, 3);
        assert!(past_end.is_empty());
        let (zero_pages, none) = paginate(&items, 1, 0);
        assert_eq!(zero_pages, 0);
        assert!(none.is_empty());
    }
}
