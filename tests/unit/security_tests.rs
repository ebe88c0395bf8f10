//! Default sandbox behaviour and task id validation.

use std::collections::BTreeMap;

use agent_shepherd::security::{
    self, env, EnvMode, EnvPolicy, SecuritySettings, POLICY_ENV_VAR,
};
use agent_shepherd::AppError;

fn inherited() -> Vec<(&'static str, &'static str)> {
    vec![
        ("PATH", "/usr/bin"),
        ("HOME", "/home/dev"),
        ("GITHUB_TOKEN", "ghp_secret"),
        ("AWS_ACCESS_KEY_ID", "AKIA"),
        ("OPENAI_API_KEY", "sk-other"),
        ("ANTHROPIC_API_KEY", "sk-ant"),
        ("LC_ALL", "C"),
        ("EDITOR", "vim"),
        ("db_password", "hunter2"),
    ]
}

#[test]
fn default_sandbox_drops_credentials() {
    let policy = EnvPolicy::compile(&SecuritySettings::default()).unwrap();
    let env = policy.scrub(inherited());

    for kept in ["PATH", "HOME", "ANTHROPIC_API_KEY", "LC_ALL", "EDITOR"] {
        assert!(env.contains_key(kept), "{kept} should survive");
    }
    for dropped in ["GITHUB_TOKEN", "AWS_ACCESS_KEY_ID", "OPENAI_API_KEY", "db_password"] {
        assert!(!env.contains_key(dropped), "{dropped} should be scrubbed");
    }
    let descriptor = &env[POLICY_ENV_VAR];
    assert!(descriptor.starts_with("mode=sandboxed"));
    assert!(descriptor.contains("*_TOKEN"));
}

#[test]
fn unrestricted_keeps_credentials_but_still_describes_policy() {
    let settings = SecuritySettings {
        env_mode: EnvMode::Unrestricted,
        ..SecuritySettings::default()
    };
    let env = EnvPolicy::compile(&settings).unwrap().scrub(inherited());
    assert_eq!(env["GITHUB_TOKEN"], "ghp_secret");
    assert_eq!(env[POLICY_ENV_VAR], "mode=unrestricted");
}

#[test]
fn injected_and_extra_layers_override_inherited() {
    let policy = EnvPolicy::compile(&SecuritySettings::default()).unwrap();
    let injected = BTreeMap::from([("HOME".to_owned(), "/injected".to_owned())]);
    let extra = BTreeMap::from([
        ("HOME".to_owned(), "/extra".to_owned()),
        ("GITHUB_TOKEN".to_owned(), "explicit".to_owned()),
    ]);

    let composed = env::compose(&policy, inherited(), &injected, &extra);
    assert_eq!(composed["HOME"], "/extra");
    assert_eq!(composed["GITHUB_TOKEN"], "explicit", "caller extras always win");
}

#[test]
fn task_ids_with_shell_characters_are_rejected() {
    for bad in ["abc;rm", "", "a b", "../x", "t$1", "x\ny"] {
        assert!(
            matches!(security::validate_task_id(bad), Err(AppError::InvalidTaskId(_))),
            "{bad:?} should be rejected"
        );
    }
    for good in ["task-1", "T_2.final", "abc"] {
        assert!(security::validate_task_id(good).is_ok());
    }
}
