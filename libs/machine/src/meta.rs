//! Meta-key projection: the tag-16 meta key carries the unique machine
//! token.

use async_trait::async_trait;
use talemu_resource::Resource;
use talemu_resource::config::{MetaKey, UniqueToken, id};
use talemu_runtime::{Result, TransformController, Transformed};

pub struct UniqueTokenController;

#[async_trait]
impl TransformController for UniqueTokenController {
    type Input = MetaKey;
    type Output = UniqueToken;

    fn name(&self) -> &'static str {
        "UniqueTokenController"
    }

    fn input_filter(&self, input: &Resource<MetaKey>) -> bool {
        input.spec.tag == MetaKey::UNIQUE_TOKEN_TAG
    }

    fn output_id(&self, _input: &Resource<MetaKey>) -> String {
        id::CURRENT.to_string()
    }

    async fn transform(&self, input: &Resource<MetaKey>) -> Result<Transformed<UniqueToken>> {
        Ok(Transformed::Apply(UniqueToken {
            token: input.spec.value.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use talemu_runtime::{ControllerRuntime, RuntimeMetrics, TransformAdapter};
    use talemu_state::{Store, WriteOptions};
    use tokio_util::sync::CancellationToken;

    use super::*;

    #[tokio::test]
    async fn test_tag_16_projects_to_token() {
        let store = Arc::new(Store::in_memory());
        let cancel = CancellationToken::new();
        let mut runtime = ControllerRuntime::new(
            store.clone(),
            Arc::new(RuntimeMetrics::new()),
            cancel.clone(),
        );
        runtime
            .register(TransformAdapter(UniqueTokenController))
            .unwrap();
        let handle = tokio::spawn(runtime.run());

        // A non-token tag produces nothing.
        store
            .create(
                Resource::new(
                    MetaKey::id_for_tag(10),
                    MetaKey {
                        tag: 10,
                        value: "ignored".to_string(),
                    },
                ),
                &WriteOptions::system(),
            )
            .unwrap();

        store
            .create(
                Resource::new(
                    MetaKey::id_for_tag(MetaKey::UNIQUE_TOKEN_TAG),
                    MetaKey {
                        tag: MetaKey::UNIQUE_TOKEN_TAG,
                        value: "token-value".to_string(),
                    },
                ),
                &WriteOptions::system(),
            )
            .unwrap();

        let token = tokio::time::timeout(
            Duration::from_secs(5),
            store.watch_for::<UniqueToken>(id::CURRENT, |t| t.spec.token == "token-value"),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(token.metadata.id, id::CURRENT);

        cancel.cancel();
        handle.await.unwrap();
    }
}
