//! Checks that the default fastembed model ranks paraphrased support
//! questions above unrelated articles.

use std::time::Instant;

use kbsearch::config::EmbeddingConfig;
use kbsearch::semantic::build_embedder;
use kbsearch::vector::cosine_similarity;

/// Get a unique cache directory for each test to avoid conflicts
fn get_test_cache_dir(test_name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!(
        "kbsearch_test_fastembed_{}_{}",
        test_name,
        std::process::id()
    ))
}

struct ArticlePair {
    name: &'static str,
    question: &'static str,
    related: &'static str,
    unrelated: &'static str,
}

#[test]
#[ignore = "Downloads 86MB model - run with --ignored for embedding checks"]
fn paraphrases_outrank_unrelated_articles() {
    let config = EmbeddingConfig {
        cache_dir: get_test_cache_dir("paraphrases"),
        show_download_progress: false,
        ..EmbeddingConfig::default()
    };
    let embedder = build_embedder(&config).unwrap();

    let pairs = [
        ArticlePair {
            name: "password reset",
            question: "I forgot my password and cannot log in",
            related: "Reset your password from the sign-in page using the emailed link",
            unrelated: "Orders ship within three business days",
        },
        ArticlePair {
            name: "refunds",
            question: "When will I get my money back?",
            related: "Refunds are issued to the original payment method within five days",
            unrelated: "Change the display language in your profile settings",
        },
        ArticlePair {
            name: "shipping",
            question: "How long does delivery take?",
            related: "Standard shipping arrives in three to five business days",
            unrelated: "Two-factor authentication protects your account",
        },
    ];

    for pair in &pairs {
        let start = Instant::now();
        let embeddings = embedder
            .generate_embeddings(&[pair.question, pair.related, pair.unrelated])
            .unwrap();
        let related = cosine_similarity(&embeddings[0], &embeddings[1]);
        let unrelated = cosine_similarity(&embeddings[0], &embeddings[2]);

        println!(
            "{:<16} related={related:.3} unrelated={unrelated:.3} ({:?})",
            pair.name,
            start.elapsed()
        );
        assert!(
            related > unrelated,
            "{}: related {related} should beat unrelated {unrelated}",
            pair.name
        );
    }

    let _ = std::fs::remove_dir_all(&config.cache_dir);
}
