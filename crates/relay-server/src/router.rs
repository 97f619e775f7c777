use std::sync::Arc;

use relay_kernel::{classify_fields, TaggedStory, TaggedStoryError};
use tracing::debug;

use crate::tracker::Resolver;

/// A story ready for the emitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedMessage {
    /// Room name; the emitter builds the send URL from it.
    pub room: String,
    pub text: String,
    pub references: Vec<String>,
}

pub struct StoryRouter {
    resolve_types: Vec<String>,
    default_room: String,
    resolver: Arc<Resolver>,
}

impl StoryRouter {
    pub fn new(resolve_types: Vec<String>, default_room: String, resolver: Arc<Resolver>) -> Self {
        Self {
            resolve_types,
            default_room,
            resolver,
        }
    }

    /// `Ok(None)` for events without `storyText`. Tagged stories are posted to
    /// the room named by their `tag` and never carry references, so the
    /// resolver is only consulted for plain stories.
    pub async fn route(
        &self,
        fields: &[(String, String)],
    ) -> Result<Option<RoutedMessage>, TaggedStoryError> {
        let event = classify_fields(fields, &self.resolve_types);
        let Some(story) = event.story else {
            return Ok(None);
        };

        if event.tagged {
            if !event.identifiers.is_empty() {
                debug!(
                    dropped = event.identifiers.len(),
                    "tagged story ignores references"
                );
            }
            let tagged = TaggedStory::parse(&story)?;
            return Ok(Some(RoutedMessage {
                room: tagged.room,
                text: tagged.text,
                references: Vec::new(),
            }));
        }

        let references = if event.identifiers.is_empty() {
            Vec::new()
        } else {
            self.resolver.resolve(&event.identifiers).await
        };
        Ok(Some(RoutedMessage {
            room: self.default_room.clone(),
            text: story,
            references,
        }))
    }
}
