#![no_main]

use libfuzzer_sys::fuzz_target;
use publisher_types::ResourceTags;

fuzz_target!(|data: &str| {
    if let Ok(tags) = data.parse::<ResourceTags>() {
        let query = tags.to_query();
        let reparsed: ResourceTags = query.parse().expect("query re-parses");
        assert_eq!(reparsed, tags);
    }
});
