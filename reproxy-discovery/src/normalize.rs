use reproxy_core::rule::{MatchType, Rule};

/// Apply the two rebuild-time transforms to a freshly-merged, flat rule list, in the order
/// the discovery service's rebuild step requires them: redirect-prefix extraction, then
/// mapper extension (capture-ref rewriting and the static/proxy auto-completions).
pub fn normalize(rules: Vec<Rule>) -> Vec<Rule> {
    rules.into_iter().map(extract_redirect).map(extend_mapper).collect()
}

fn extract_redirect(mut rule: Rule) -> Rule {
    let (redirect_type, rest) = Rule::extract_redirect(&rule.dst);
    if redirect_type != reproxy_core::rule::RedirectType::None {
        rule.dst = rest.to_string();
        rule.redirect_type = redirect_type;
    }
    rule
}

fn extend_mapper(mut rule: Rule) -> Rule {
    rule.dst = Rule::rewrite_capture_refs(&rule.dst);

    match rule.match_type {
        MatchType::Static => {
            if rule.assets_web_root.is_none() {
                rule.assets_web_root = Some(rule.src_pattern.trim_end_matches('/').to_string());
            }
            if rule.assets_location.is_none() {
                rule.assets_location = Some(rule.dst.clone());
            }
        }
        MatchType::Proxy => {
            let has_capture_group = rule.dst.contains('$') || rule.src_pattern.contains('(');
            if rule.src_pattern.ends_with('/') && !has_capture_group {
                let src = rule.src_pattern.trim_end_matches('/');
                rule.src_pattern = format!("^{src}/(.*)");
                let dst = rule.dst.trim_end_matches('/');
                rule.dst = format!("{dst}/$1");
            }
        }
    }

    rule
}
