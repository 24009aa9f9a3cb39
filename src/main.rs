use std::time::Duration;
use tracing::{info, info_span, Instrument};
use treadmill::logging::setup_tracing;
use treadmill::{
    async_trait, handler_fn, BoxError, Contributions, FromScope, Handler, HandlerRegistry,
    HandlerState, Outcome, Reply, ResolveError, Scope, Step, Treadmill, TreadmillConfig,
};

#[derive(Debug, Clone)]
struct Request {
    path: String,
    token: Option<String>,
}

#[derive(Debug, Clone)]
struct User(String);

#[derive(Debug, Clone)]
struct Profile {
    display_name: String,
    visits: u32,
}

/// Saturates instead of wrapping on oversized inputs.
fn visit_count(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

/// Rejects requests without a token, otherwise contributes the caller.
struct Authenticate;

#[async_trait]
impl Handler<Reply> for Authenticate {
    async fn handle(&self, step: &mut Step<'_, Reply>) -> Result<HandlerState, BoxError> {
        let request = step.require::<Request>()?;
        match &request.token {
            Some(token) => Ok(HandlerState::proceed().with(User(token.clone()))),
            None => Ok(HandlerState::reject()),
        }
    }
}

/// Built per run from the authenticated user; loads the profile in the background.
struct LoadProfile {
    user: User,
}

impl FromScope for LoadProfile {
    fn from_scope(scope: &Scope) -> Result<Self, ResolveError> {
        Ok(Self {
            user: scope.require::<User>()?.clone(),
        })
    }
}

#[async_trait]
impl Handler<Reply> for LoadProfile {
    async fn handle(&self, step: &mut Step<'_, Reply>) -> Result<HandlerState, BoxError> {
        let resumer = step.defer()?;
        let user = self.user.clone();
        tokio::spawn(async move {
            // Simulated database round trip
            tokio::time::sleep(Duration::from_millis(20)).await;
            resumer.resume_with(Profile {
                display_name: user.0.to_uppercase(),
                visits: visit_count(user.0.len()),
            });
        });
        step.response_mut().add_header("x-user", self.user.0.clone());
        Ok(HandlerState::proceed())
    }

    fn name(&self) -> &'static str {
        "load_profile"
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    setup_tracing();

    let config = TreadmillConfig::from_env()?
        .with_deferral_timeout(Duration::from_secs(2))
        .with_chain("profile", ["authenticate", "load_profile", "render"]);

    let mut registry = HandlerRegistry::<Reply>::new();
    registry
        .register("authenticate", Authenticate)?
        .register_type::<LoadProfile>("load_profile")?
        .register(
            "render",
            handler_fn(|step: &mut Step<'_, Reply>| {
                if step.require::<Request>()?.path != "/profile" {
                    return Ok(HandlerState::proceed());
                }
                let profile = step.require::<Profile>()?.clone();
                step.response_mut().respond(
                    200,
                    format!("{} ({} visits)", profile.display_name, profile.visits),
                );
                Ok(HandlerState::finish())
            })
            .named("render"),
        )?;

    let chain = registry.configured_chain(&config, "profile")?;
    let treadmill = Treadmill::builder(Reply::default).config(config).build()?;

    let requests = [
        Request {
            path: "/profile".into(),
            token: Some("alice".into()),
        },
        Request {
            path: "/profile".into(),
            token: None,
        },
        Request {
            path: "/elsewhere".into(),
            token: Some("bob".into()),
        },
    ];

    for request in requests {
        let span = info_span!("request", path = %request.path);
        let outcome = treadmill
            .run_async(&chain, Contributions::new().with(request))
            .instrument(span)
            .await;

        match outcome {
            Outcome::Done(reply) => info!(status = ?reply.status(), body = ?reply.body(), "Served"),
            Outcome::Rejected => info!("Rejected"),
            Outcome::Fallthrough(reply) => {
                info!(headers = ?reply.headers(), "No handler finished the request")
            }
            Outcome::Failed(error) => info!(%error, "Failed"),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visit_count_saturates() {
        assert_eq!(visit_count(5), 5);
        assert_eq!(visit_count(usize::MAX), u32::MAX);
    }
}
