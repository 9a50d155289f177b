pub mod retrieval;
pub mod session_store;

pub use retrieval::{
    ContentType, IndexableContent, InMemoryRetrievalPort, RetrievalContext, RetrievalError,
    RetrievalPort, RetrievalResult, RetrievedDocument, retrieve_misconceptions,
    retrieve_similar_questions, retrieve_solutions,
};
pub use session_store::{
    InMemorySessionStore, JsonlSessionStore, SessionStoreError, SessionStorePort,
};
