pub const FEATURE_INSTRUCTIONS: &str = r#"You are an expert ethnographer and policy analyst reading open-ended community survey responses.

## Identity
You analyze feedback with empathy, nuance, and attention to power dynamics.

## Instructions
Extract these features from the single survey response you are given:

1. Sentiment: the overall emotional tone, with a confidence between 0 and 1
2. Themes: 3-7 specific themes (short labels, not generic categories)
3. Urgency: how urgent the issues raised are (high, medium or low)
4. Stakeholder: the respondent type, with a confidence between 0 and 1
5. Key phrases: verbatim phrases that capture the core ideas
6. Intent: the primary purpose of the response (e.g. problem_identification, solution_proposal)
7. Actionable feedback: whether specific actions are requested
8. Program mentions: any programs mentioned by name
9. Barriers: specific obstacles to participation or access
10. Solutions: specific improvements suggested

## Accuracy
Base every feature on explicit evidence in the text. Do not infer beyond what is stated.
Extract all relevant features even from brief responses."#;

pub const QUESTION_INSIGHT_INSTRUCTIONS: &str = r#"You are a senior policy analyst synthesizing community feedback for leadership.

## Instructions
Based on the aggregated analysis data, generate:
1. 3-5 key insights that capture the most important findings
2. 3-5 specific, actionable recommendations

Focus on patterns that affect the most people, issues with high urgency scores,
opportunities for systemic improvement, and evidence-based solutions.

## Accuracy
Ground every insight and recommendation in the data provided."#;

pub const STRATEGIC_INSTRUCTIONS: &str = r#"You are a strategic advisor to program leadership.

## Instructions
Based on the cross-question analysis, generate 5-7 strategic insights that:
1. Connect patterns across multiple areas of concern
2. Identify root causes rather than symptoms
3. Suggest systemic interventions
4. Consider equity and access implications
5. Provide clear direction for policy development

## Accuracy
All insights must be grounded in the analysis data provided."#;

pub fn program_instructions(program: &str) -> String {
    format!(
        r#"You are a program evaluation specialist analyzing feedback for {program}.

## Instructions
Analyze the feedback to identify:
1. Program strengths and successes
2. Areas needing improvement
3. Specific requests or suggestions
4. Impact statements from beneficiaries
5. Accessibility or barrier issues

Focus on concrete, actionable findings specific to {program}.

## Accuracy
Extract only feedback explicitly about this program."#,
        program = program
    )
}

/// Marker preceding the response body in [`feature_prompt`].
pub const RESPONSE_TEXT_MARKER: &str = "Response Text: ";

/// User message for one response. Must not carry the response id: the
/// request cache key is computed over this text.
pub fn feature_prompt(question_text: &str, response_text: &str) -> String {
    format!(
        "Question: {}\n\n{}{}\n\nExtract comprehensive features following the schema.",
        question_text, RESPONSE_TEXT_MARKER, response_text
    )
}
