//! Environment map composition (§4.5 step 2).
//!
//! Precedence, lowest to highest: user-supplied `env_vars` < decrypted
//! secrets < conditional git-host variables < reserved variables. Reserved
//! variables always win regardless of what the caller supplied.

use std::collections::HashMap;

use agent_session_types::GitSource;

pub struct ReservedEnv<'a> {
    pub home: &'a str,
    pub session_id: &'a str,
    pub session_home: &'a str,
    pub kilocode_token: &'a str,
    pub kilocode_organization_id: Option<&'a str>,
}

const KILO_PLATFORM_DEFAULT: &str = "cloud-agent";

/// Derives the host portion of a generic git URL for `GITLAB_HOST`.
fn derive_host(git_url: &str) -> Option<String> {
    let without_scheme = git_url.split("://").nth(1).unwrap_or(git_url);
    let host = without_scheme.split(['/', '@']).find(|s| !s.is_empty())?;
    let host = host.rsplit_once('@').map(|(_, h)| h).unwrap_or(host);
    Some(host.to_string())
}

pub fn build_environment(
    user_env_vars: &HashMap<String, String>,
    decrypted_secrets: &HashMap<String, String>,
    source: &GitSource,
    reserved: ReservedEnv<'_>,
) -> HashMap<String, String> {
    let mut env = HashMap::new();

    // Lowest precedence: user-supplied.
    env.extend(user_env_vars.clone());
    // Decrypted secrets merge before reserved variables, after user vars.
    env.extend(decrypted_secrets.clone());

    // Conditional git-host variables, only when no user override already set them.
    match source {
        GitSource::GitHub { github_repo, github_token } => {
            if !github_repo.is_empty() {
                if let Some(token) = github_token {
                    env.entry("GH_TOKEN".to_string()).or_insert_with(|| token.clone());
                }
            }
        }
        GitSource::Generic { git_url, git_token } => {
            if source.is_gitlab() {
                if let Some(token) = git_token {
                    env.entry("GITLAB_TOKEN".to_string()).or_insert_with(|| token.clone());
                }
                env.entry("GLAB_IS_OAUTH2".to_string()).or_insert_with(|| "true".to_string());
                if let Some(host) = derive_host(git_url) {
                    env.entry("GITLAB_HOST".to_string()).or_insert(host);
                }
            }
        }
    }

    // Reserved variables always take precedence, overwriting anything above.
    env.insert("HOME".to_string(), reserved.home.to_string());
    env.insert("SESSION_ID".to_string(), reserved.session_id.to_string());
    env.insert("SESSION_HOME".to_string(), reserved.session_home.to_string());
    env.insert("KILOCODE_TOKEN".to_string(), reserved.kilocode_token.to_string());
    env.insert("KILO_PLATFORM".to_string(), KILO_PLATFORM_DEFAULT.to_string());
    if let Some(org_id) = reserved.kilocode_organization_id {
        env.insert("KILOCODE_ORGANIZATION_ID".to_string(), org_id.to_string());
    }

    env
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reserved<'a>(home: &'a str, session_id: &'a str, session_home: &'a str, token: &'a str) -> ReservedEnv<'a> {
        ReservedEnv {
            home,
            session_id,
            session_home,
            kilocode_token: token,
            kilocode_organization_id: None,
        }
    }

    #[test]
    fn reserved_vars_win_over_user_overrides() {
        let mut user_env = HashMap::new();
        user_env.insert("HOME".to_string(), "/evil".to_string());
        let source = GitSource::GitHub {
            github_repo: "acme/repo".into(),
            github_token: Some("t1".into()),
        };
        let env = build_environment(&user_env, &HashMap::new(), &source, reserved("/home/s1", "s1", "/home/s1", "kilo-tok"));
        assert_eq!(env.get("HOME"), Some(&"/home/s1".to_string()));
    }

    #[test]
    fn gh_token_set_when_github_repo_present() {
        let source = GitSource::GitHub {
            github_repo: "acme/repo".into(),
            github_token: Some("t1".into()),
        };
        let env = build_environment(&HashMap::new(), &HashMap::new(), &source, reserved("/h", "s1", "/h", "k"));
        assert_eq!(env.get("GH_TOKEN"), Some(&"t1".to_string()));
    }

    #[test]
    fn gitlab_host_vars_set_for_gitlab_remote() {
        let source = GitSource::Generic {
            git_url: "https://gitlab.example.com/acme/repo.git".into(),
            git_token: Some("t2".into()),
        };
        let env = build_environment(&HashMap::new(), &HashMap::new(), &source, reserved("/h", "s1", "/h", "k"));
        assert_eq!(env.get("GITLAB_TOKEN"), Some(&"t2".to_string()));
        assert_eq!(env.get("GLAB_IS_OAUTH2"), Some(&"true".to_string()));
        assert_eq!(env.get("GITLAB_HOST"), Some(&"gitlab.example.com".to_string()));
    }

    #[test]
    fn user_override_of_conditional_var_is_respected() {
        let mut user_env = HashMap::new();
        user_env.insert("GH_TOKEN".to_string(), "user-supplied".to_string());
        let source = GitSource::GitHub {
            github_repo: "acme/repo".into(),
            github_token: Some("stored".into()),
        };
        let env = build_environment(&user_env, &HashMap::new(), &source, reserved("/h", "s1", "/h", "k"));
        assert_eq!(env.get("GH_TOKEN"), Some(&"user-supplied".to_string()));
    }
}
