use redprobe::error::ProbeError;
use redprobe::httpspec::{
    FilePart, HttpSpec, Modality, PromptPayload, RequestBody, AUDIO_PLACEHOLDER,
    IMAGE_PLACEHOLDER, PROMPT_PLACEHOLDER,
};

const JSON_BLUEPRINT: &str =
    "POST https://x/\nContent-Type: application/json\n\n{\"p\":\"<<PROMPT>>\"}";

fn body_bytes(spec: &HttpSpec, payload: &PromptPayload) -> Vec<u8> {
    match spec.materialize(payload).unwrap().body {
        RequestBody::Bytes(b) => b,
        RequestBody::Multipart { .. } => panic!("expected a byte body"),
    }
}

#[test]
fn parse_print_round_trips() {
    let blueprint = "POST https://api.example.com/v1/chat\nAuthorization: Bearer tok\nContent-Type: application/json\n\n{\"messages\":[{\"content\":\"<<PROMPT>>\"}]}";
    let spec = HttpSpec::parse(blueprint).unwrap();
    assert_eq!(spec.print(), format!("{blueprint}"));
    // And printing a reparse is a fixed point.
    let reparsed = HttpSpec::parse(&spec.print()).unwrap();
    assert_eq!(reparsed.print(), spec.print());
}

#[test]
fn modality_detection_covers_all_combinations() {
    for mask in 0..16u32 {
        let with_prompt = mask & 1 != 0;
        let with_image = mask & 2 != 0;
        let with_audio = mask & 4 != 0;
        let multipart = mask & 8 != 0;

        let mut body = String::from("{");
        if with_prompt {
            body.push_str(&format!("\"p\":\"{PROMPT_PLACEHOLDER}\","));
        }
        if with_image {
            body.push_str(&format!("\"img\":\"{IMAGE_PLACEHOLDER}\","));
        }
        if with_audio {
            body.push_str(&format!("\"aud\":\"{AUDIO_PLACEHOLDER}\","));
        }
        body.push_str("\"model\":\"m\"}");

        let content_type = if multipart {
            "multipart/form-data; boundary=x"
        } else {
            "application/json"
        };
        let blueprint = format!("POST https://x/\nContent-Type: {content_type}\n\n{body}");
        let spec = HttpSpec::parse(&blueprint).unwrap();

        let expected = if multipart {
            Modality::Files
        } else if with_image {
            Modality::Image
        } else if with_audio {
            Modality::Audio
        } else {
            Modality::Text
        };
        assert_eq!(spec.modality, expected, "mask {mask:#06b}");
    }
}

#[test]
fn prompt_substitution_changes_nothing_else() {
    let spec = HttpSpec::parse(JSON_BLUEPRINT).unwrap();
    let body = body_bytes(
        &spec,
        &PromptPayload::Text {
            prompt: "say \"hi\"\nplease".into(),
        },
    );
    // JSON content type: the prompt is JSON-escaped in place.
    assert_eq!(
        String::from_utf8(body).unwrap(),
        "{\"p\":\"say \\\"hi\\\"\\nplease\"}"
    );
}

#[test]
fn non_json_bodies_take_the_prompt_raw() {
    let spec =
        HttpSpec::parse("POST https://x/\nContent-Type: text/plain\n\nsay: <<PROMPT>>!").unwrap();
    let body = body_bytes(
        &spec,
        &PromptPayload::Text {
            prompt: "a \"quoted\" word".into(),
        },
    );
    assert_eq!(String::from_utf8(body).unwrap(), "say: a \"quoted\" word!");
}

#[test]
fn no_placeholder_survives_materialization() {
    let blueprint = format!(
        "POST https://x/\nContent-Type: application/json\n\n{{\"p\":\"{PROMPT_PLACEHOLDER}\",\"img\":\"{IMAGE_PLACEHOLDER}\"}}"
    );
    let spec = HttpSpec::parse(&blueprint).unwrap();
    assert_eq!(spec.modality, Modality::Image);
    let body = body_bytes(
        &spec,
        &PromptPayload::Image {
            prompt: "p".into(),
            image_b64: "aGk=".into(),
        },
    );
    let body = String::from_utf8(body).unwrap();
    assert!(!body.contains("<<"));
    assert!(body.contains("aGk="));
}

#[test]
fn modality_mismatch_fails_before_any_request() {
    let blueprint = format!(
        "POST https://x/\nContent-Type: application/json\n\n{{\"img\":\"{IMAGE_PLACEHOLDER}\"}}"
    );
    let spec = HttpSpec::parse(&blueprint).unwrap();
    let err = spec
        .materialize(&PromptPayload::Audio {
            prompt: "p".into(),
            audio_b64: "aGk=".into(),
        })
        .unwrap_err();
    match err {
        ProbeError::Modality { expected, supplied } => {
            assert_eq!(expected, Modality::Image);
            assert_eq!(supplied, "audio");
        }
        other => panic!("expected modality error, got {other:?}"),
    }
}

#[test]
fn content_length_is_added_when_missing() {
    let spec = HttpSpec::parse(JSON_BLUEPRINT).unwrap();
    let req = spec
        .materialize(&PromptPayload::Text { prompt: "hi".into() })
        .unwrap();
    let body_len = match &req.body {
        RequestBody::Bytes(b) => b.len(),
        _ => unreachable!(),
    };
    let clen = req
        .headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
        .map(|(_, v)| v.clone())
        .expect("content-length appended");
    assert_eq!(clen, body_len.to_string());
}

#[test]
fn existing_content_length_is_left_alone() {
    let spec = HttpSpec::parse(
        "POST https://x/\nContent-Length: 999\nContent-Type: application/json\n\n{\"p\":\"<<PROMPT>>\"}",
    )
    .unwrap();
    let req = spec
        .materialize(&PromptPayload::Text { prompt: "hi".into() })
        .unwrap();
    let count = req
        .headers
        .iter()
        .filter(|(n, _)| n.eq_ignore_ascii_case("content-length"))
        .count();
    assert_eq!(count, 1);
    assert_eq!(req.headers[0].1, "999");
}

#[test]
fn multipart_specs_build_form_fields_from_json_bodies() {
    let blueprint = "POST https://x/upload\nContent-Type: multipart/form-data\n\n{\"question\":\"<<PROMPT>>\",\"mode\":\"strict\"}";
    let spec = HttpSpec::parse(blueprint).unwrap();
    assert_eq!(spec.modality, Modality::Files);

    let req = spec
        .materialize(&PromptPayload::Files {
            prompt: "what is this".into(),
            files: vec![FilePart {
                field: "file".into(),
                filename: "a.txt".into(),
                mime: "text/plain".into(),
                data: b"data".to_vec(),
            }],
        })
        .unwrap();
    match req.body {
        RequestBody::Multipart { text_fields, files } => {
            assert!(text_fields
                .iter()
                .any(|(k, v)| k == "question" && v == "what is this"));
            assert!(text_fields.iter().any(|(k, v)| k == "mode" && v == "strict"));
            assert_eq!(files.len(), 1);
            assert_eq!(files[0].filename, "a.txt");
        }
        _ => panic!("expected multipart body"),
    }
}

#[test]
fn spec_errors_cover_the_parse_failure_modes() {
    // No blank-line separator.
    assert!(matches!(
        HttpSpec::parse("POST https://x/\nContent-Type: a/b"),
        Err(ProbeError::Spec(_))
    ));
    // Request line without a URL.
    assert!(matches!(
        HttpSpec::parse("POST\n\n"),
        Err(ProbeError::Spec(_))
    ));
    // Unknown method.
    assert!(matches!(
        HttpSpec::parse("FETCH https://x/\n\n"),
        Err(ProbeError::Spec(_))
    ));
    // URL that does not parse.
    assert!(matches!(
        HttpSpec::parse("GET ://nope\n\n"),
        Err(ProbeError::Spec(_))
    ));
}
