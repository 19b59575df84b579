use gateway_common::config::GatewayConfig;

/// The method (or resume dispatch) selected for a request, as produced by
/// [`choose`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChosenMethod {
    SpawnWithHeader,
    SpawnWithDecoded,
    RemoteLoginSsh,
    XLoginReply,
    None,
}

/// Maps `(auth_type, loopback_flag, config)` to a method, first match wins.
/// A missing `Authorization` header is treated as type `"negotiate"`
/// upstream, before this function is ever called.
pub fn choose(auth_type: &str, loopback: bool, config: &GatewayConfig) -> ChosenMethod {
    if auth_type == "x-login-reply" {
        return ChosenMethod::XLoginReply;
    }
    if loopback && auth_type == "basic" {
        return ChosenMethod::RemoteLoginSsh;
    }
    if let Some(action) = config.auth_type(auth_type).and_then(|t| t.action.as_deref()) {
        return match action {
            "spawn-login-with-header" => ChosenMethod::SpawnWithHeader,
            "spawn-login-with-decoded" => ChosenMethod::SpawnWithDecoded,
            "remote-login-ssh" => ChosenMethod::RemoteLoginSsh,
            "x-login-reply" => ChosenMethod::XLoginReply,
            "none" => ChosenMethod::None,
            _ => ChosenMethod::None,
        };
    }
    if auth_type == "basic" || auth_type == "negotiate" {
        return ChosenMethod::SpawnWithDecoded;
    }
    ChosenMethod::None
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_common::config::AuthTypeConfig;

    #[test]
    fn resume_token_wins_regardless_of_everything_else() {
        let cfg = GatewayConfig::default();
        assert_eq!(choose("x-login-reply", true, &cfg), ChosenMethod::XLoginReply);
    }

    #[test]
    fn loopback_basic_goes_over_ssh() {
        let cfg = GatewayConfig::default();
        assert_eq!(choose("basic", true, &cfg), ChosenMethod::RemoteLoginSsh);
    }

    #[test]
    fn configured_action_overrides_default() {
        let mut cfg = GatewayConfig::default();
        cfg.auth_types.insert(
            "negotiate".to_string(),
            AuthTypeConfig {
                action: Some("remote-login-ssh".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(choose("negotiate", false, &cfg), ChosenMethod::RemoteLoginSsh);
    }

    #[test]
    fn basic_and_negotiate_default_to_spawn_decoded() {
        let cfg = GatewayConfig::default();
        assert_eq!(choose("basic", false, &cfg), ChosenMethod::SpawnWithDecoded);
        assert_eq!(choose("negotiate", false, &cfg), ChosenMethod::SpawnWithDecoded);
    }

    #[test]
    fn unknown_type_falls_through_to_none() {
        let cfg = GatewayConfig::default();
        assert_eq!(choose("digest", false, &cfg), ChosenMethod::None);
    }
}
