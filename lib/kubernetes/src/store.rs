use async_trait::async_trait;

use super::client::{Client, Error};
use super::resource::Resource;

/// CRUD operations on namespaced objects, implemented by [`Client`] and, for
/// tests, by an in-memory store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// The namespace every call operates in.
    fn namespace(&self) -> &str;

    /// Get a named object, `Ok(None)` when it does not exist.
    async fn get<R: Resource>(&self, name: &str) -> Result<Option<R>, Error>;

    /// List all objects matching the label selector, e.g. `foo=bar,baz=qux`.
    async fn list<R: Resource>(&self, label_selector: &str) -> Result<Vec<R>, Error>;

    async fn create<R: Resource>(&self, obj: &R) -> Result<R, Error>;

    async fn replace<R: Resource>(&self, name: &str, obj: &R) -> Result<R, Error>;

    async fn delete<R: Resource>(&self, name: &str) -> Result<(), Error>;
}

#[async_trait]
impl ObjectStore for Client {
    fn namespace(&self) -> &str {
        Client::namespace(self)
    }

    async fn get<R: Resource>(&self, name: &str) -> Result<Option<R>, Error> {
        Client::get(self, name).await
    }

    async fn list<R: Resource>(&self, label_selector: &str) -> Result<Vec<R>, Error> {
        self.list_all(label_selector).await
    }

    async fn create<R: Resource>(&self, obj: &R) -> Result<R, Error> {
        Client::create(self, obj).await
    }

    async fn replace<R: Resource>(&self, name: &str, obj: &R) -> Result<R, Error> {
        Client::replace(self, name, obj).await
    }

    async fn delete<R: Resource>(&self, name: &str) -> Result<(), Error> {
        Client::delete::<R>(self, name).await
    }
}

#[cfg(any(test, feature = "test-util"))]
pub use memory::MemoryStore;

#[cfg(any(test, feature = "test-util"))]
mod memory {
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use http::StatusCode;

    use super::ObjectStore;
    use crate::client::{Error, ErrorResponse};
    use crate::resource::Resource;

    #[derive(Default)]
    struct State {
        // keyed by (plural, name)
        objects: BTreeMap<(String, String), serde_json::Value>,
        revision: u64,
        writes: usize,
        failing: BTreeSet<String>,
    }

    /// An in-memory API server, which behaves like the real one on the parts
    /// this crate uses: conflicts on create of existing objects or stale
    /// `resourceVersion`s, not found on missing objects, and equality based
    /// label selectors.
    #[derive(Default)]
    pub struct MemoryStore {
        namespace: String,
        state: Mutex<State>,
    }

    fn api_error(status: StatusCode, message: String) -> Error {
        let mut resp = ErrorResponse::from_status(status, message.as_bytes());
        resp.message = message;
        Error::Api(resp)
    }

    fn matches(labels: &BTreeMap<String, String>, selector: &str) -> bool {
        selector
            .split(',')
            .map(str::trim)
            .filter(|term| !term.is_empty())
            .all(|term| match term.split_once('=') {
                Some((key, value)) => labels.get(key.trim()).map(String::as_str) == Some(value.trim()),
                None => labels.contains_key(term),
            })
    }

    impl MemoryStore {
        pub fn new(namespace: impl Into<String>) -> Self {
            MemoryStore {
                namespace: namespace.into(),
                state: Mutex::default(),
            }
        }

        fn state(&self) -> std::sync::MutexGuard<'_, State> {
            self.state.lock().unwrap_or_else(|err| err.into_inner())
        }

        /// Put an object into the store without counting it as a write.
        pub fn insert<R: Resource>(&self, mut obj: R) {
            let mut state = self.state();
            state.revision += 1;
            let revision = state.revision.to_string();

            let metadata = obj.metadata_mut();
            metadata.namespace = Some(self.namespace.clone());
            metadata.resource_version = Some(revision);

            let key = (R::PLURAL.to_string(), obj.metadata().name.clone());
            let value = serde_json::to_value(&obj).expect("serialize object");
            state.objects.insert(key, value);
        }

        /// Names of all stored objects of the resource, sorted.
        pub fn names<R: Resource>(&self) -> Vec<String> {
            self.state()
                .objects
                .keys()
                .filter(|(plural, _)| plural == R::PLURAL)
                .map(|(_, name)| name.clone())
                .collect()
        }

        /// Read an object without going through the async trait.
        pub fn object<R: Resource>(&self, name: &str) -> Option<R> {
            let state = self.state();
            let value = state
                .objects
                .get(&(R::PLURAL.to_string(), name.to_string()))?;

            Some(serde_json::from_value(value.clone()).expect("deserialize object"))
        }

        /// Number of successful create, replace and delete calls.
        pub fn writes(&self) -> usize {
            self.state().writes
        }

        /// Every write to an object with this name fails until `recover` is called.
        pub fn fail_on(&self, name: impl Into<String>) {
            self.state().failing.insert(name.into());
        }

        pub fn recover(&self, name: &str) {
            self.state().failing.remove(name);
        }

        fn check_failing(state: &State, name: &str) -> Result<(), Error> {
            if state.failing.contains(name) {
                return Err(api_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("injected failure for {name}"),
                ));
            }

            Ok(())
        }

        fn store<R: Resource>(&self, state: &mut State, obj: &R) -> Result<R, Error> {
            state.revision += 1;

            let mut obj = serde_json::from_value::<R>(
                serde_json::to_value(obj).map_err(Error::Serialize)?,
            )
            .map_err(Error::Deserialize)?;
            let metadata = obj.metadata_mut();
            metadata.namespace = Some(self.namespace.clone());
            metadata.resource_version = Some(state.revision.to_string());

            let key = (R::PLURAL.to_string(), obj.metadata().name.clone());
            let value = serde_json::to_value(&obj).map_err(Error::Serialize)?;
            state.objects.insert(key, value);
            state.writes += 1;

            Ok(obj)
        }
    }

    #[async_trait]
    impl ObjectStore for MemoryStore {
        fn namespace(&self) -> &str {
            &self.namespace
        }

        async fn get<R: Resource>(&self, name: &str) -> Result<Option<R>, Error> {
            let state = self.state();
            match state.objects.get(&(R::PLURAL.to_string(), name.to_string())) {
                Some(value) => serde_json::from_value(value.clone())
                    .map(Some)
                    .map_err(Error::Deserialize),
                None => Ok(None),
            }
        }

        async fn list<R: Resource>(&self, label_selector: &str) -> Result<Vec<R>, Error> {
            let state = self.state();

            state
                .objects
                .iter()
                .filter(|((plural, _), _)| plural == R::PLURAL)
                .map(|(_, value)| serde_json::from_value::<R>(value.clone()))
                .filter(|result| match result {
                    Ok(obj) => matches(&obj.metadata().labels, label_selector),
                    Err(_) => true,
                })
                .collect::<Result<Vec<_>, _>>()
                .map_err(Error::Deserialize)
        }

        async fn create<R: Resource>(&self, obj: &R) -> Result<R, Error> {
            let mut state = self.state();
            let name = &obj.metadata().name;

            Self::check_failing(&state, name)?;
            if state
                .objects
                .contains_key(&(R::PLURAL.to_string(), name.clone()))
            {
                return Err(api_error(
                    StatusCode::CONFLICT,
                    format!("{} \"{name}\" already exists", R::PLURAL),
                ));
            }

            self.store(&mut state, obj)
        }

        async fn replace<R: Resource>(&self, name: &str, obj: &R) -> Result<R, Error> {
            let mut state = self.state();

            Self::check_failing(&state, name)?;
            let Some(existing) = state.objects.get(&(R::PLURAL.to_string(), name.to_string()))
            else {
                return Err(api_error(
                    StatusCode::NOT_FOUND,
                    format!("{} \"{name}\" not found", R::PLURAL),
                ));
            };

            if let Some(version) = &obj.metadata().resource_version {
                let current = existing["metadata"]["resourceVersion"].as_str();
                if current != Some(version.as_str()) {
                    return Err(api_error(
                        StatusCode::CONFLICT,
                        "the object has been modified".to_string(),
                    ));
                }
            }

            self.store(&mut state, obj)
        }

        async fn delete<R: Resource>(&self, name: &str) -> Result<(), Error> {
            let mut state = self.state();

            Self::check_failing(&state, name)?;
            match state
                .objects
                .remove(&(R::PLURAL.to_string(), name.to_string()))
            {
                Some(_) => {
                    state.writes += 1;
                    Ok(())
                }
                None => Err(api_error(
                    StatusCode::NOT_FOUND,
                    format!("{} \"{name}\" not found", R::PLURAL),
                )),
            }
        }
    }

}
