//! Search-list expansion.

/// Names to query for `hostname`, in order.
///
/// An absolute name (trailing dot) is queried alone. Otherwise the name is
/// tried as given when it has at least `ndots` dots, then with each search
/// domain appended, and finally in absolute form.
pub fn candidates(hostname: &str, ndots: usize, search: &[String]) -> Vec<String> {
    if hostname.ends_with('.') {
        return vec![hostname.to_string()];
    }

    let dots = hostname.matches('.').count();
    let mut names = Vec::with_capacity(search.len() + 2);

    if dots >= ndots {
        names.push(hostname.to_string());
    }
    for domain in search {
        let domain = domain.trim_matches('.');
        if !domain.is_empty() {
            names.push(format!("{hostname}.{domain}"));
        }
    }

    let absolute = format!("{hostname}.");
    if !names.contains(&absolute) {
        names.push(absolute);
    }
    names
}
